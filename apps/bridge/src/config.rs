use std::env;
use std::net::IpAddr;

/// Pre-shared RC4 key baked into the bulb firmware. A protocol constant
/// rather than a secret; overridable for firmware batches that ship a
/// different key.
const DEFAULT_SETUP_KEY: &str = "SengledSetupKey123";

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the cloud-shaped HTTP endpoints listen on. The firmware calls
    /// port 80 unless the provisioning payload said otherwise.
    pub http_port: u16,
    /// The fixed vendor UDP control port, both for our listener and as the
    /// destination port when commanding bulbs.
    pub udp_port: u16,
    /// Address advertised to devices in broker-discovery replies.
    pub advertised_addr: IpAddr,
    pub mqtt_port: u16,
    pub mqtt_ws_port: u16,
    pub setup_key: String,
    /// A device with no contact for this long is reported stale.
    pub stale_after_secs: u64,
    /// Bound on every steady-state UDP send/receive pair.
    pub udp_timeout_secs: u64,
    /// Provisioning steps wait longer; a factory-mode bulb is slow.
    pub provisioning_timeout_secs: u64,
    pub default_user_id: String,
}

impl Config {
    pub fn from_env() -> Self {
        let advertised_addr = env::var("BRIDGE_ADVERTISED_ADDR")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or_else(detect_local_ip);

        Self {
            http_port: env_parsed("BRIDGE_HTTP_PORT", 80),
            udp_port: env_parsed("BRIDGE_UDP_PORT", 9080),
            advertised_addr,
            mqtt_port: env_parsed("BRIDGE_MQTT_PORT", 1883),
            mqtt_ws_port: env_parsed("BRIDGE_MQTT_WS_PORT", 9001),
            setup_key: env::var("BRIDGE_SETUP_KEY").unwrap_or_else(|_| DEFAULT_SETUP_KEY.into()),
            stale_after_secs: env_parsed("BRIDGE_STALE_AFTER_SECS", 300),
            udp_timeout_secs: env_parsed("BRIDGE_UDP_TIMEOUT_SECS", 3),
            provisioning_timeout_secs: env_parsed("BRIDGE_PROVISION_TIMEOUT_SECS", 10),
            default_user_id: env::var("BRIDGE_DEFAULT_USER_ID").unwrap_or_else(|_| "618".into()),
        }
    }

    /// The websocket broker address handed to devices, e.g.
    /// `ws://192.168.1.100:9001/mqtt`. No broker has to exist behind it;
    /// the firmware only needs the handshake answered.
    pub fn inception_addr(&self) -> String {
        format!("ws://{}:{}/mqtt", self.advertised_addr, self.mqtt_ws_port)
    }

    pub fn access_cloud_url(&self) -> String {
        format!(
            "http://{}:{}/life2/device/accessCloud.json",
            self.advertised_addr, self.http_port
        )
    }

    pub fn jbalancer_url(&self) -> String {
        format!(
            "http://{}:{}/jbalancer/new/bimqtt",
            self.advertised_addr, self.http_port
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 80,
            udp_port: 9080,
            advertised_addr: IpAddr::from([127, 0, 0, 1]),
            mqtt_port: 1883,
            mqtt_ws_port: 9001,
            setup_key: DEFAULT_SETUP_KEY.to_string(),
            stale_after_secs: 300,
            udp_timeout_secs: 3,
            provisioning_timeout_secs: 10,
            default_user_id: "618".to_string(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Finds the address other hosts on the LAN would reach us at by opening a
/// UDP socket toward a public address. No packet is sent; the OS just picks
/// the outbound interface.
fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            Ok(socket.local_addr()?.ip())
        })
        .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_urls_are_vendor_shaped() {
        let config = Config::default();
        assert_eq!(config.inception_addr(), "ws://127.0.0.1:9001/mqtt");
        assert_eq!(
            config.access_cloud_url(),
            "http://127.0.0.1:80/life2/device/accessCloud.json"
        );
        assert_eq!(
            config.jbalancer_url(),
            "http://127.0.0.1:80/jbalancer/new/bimqtt"
        );
    }
}
