use dashmap::DashMap;
use filament_proto::{self as proto, CommandEnvelope, Decoded};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum UdpError {
    #[error("no reply from {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("device {0} is not in the registry")]
    DeviceUnknown(String),
    #[error("device {0} has no known address")]
    AddressUnknown(String),
    #[error(transparent)]
    Encode(#[from] proto::EncodeError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Long-lived listener on the fixed control port. Bulbs send unsolicited
/// datagrams here; every one updates the registry and gets a generic ack.
/// Unparseable datagrams are acked too; the observed firmware times out
/// and retries aggressively when it hears nothing back.
pub async fn run_listener(socket: UdpSocket, registry: Arc<Registry>) {
    let mut buf = vec![0u8; 4096];
    let ack = proto::ack_reply().to_string();
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("udp receive error: {e}");
                continue;
            }
        };
        let record = registry.touch_address(peer.ip());
        match proto::decode(&buf[..len]) {
            Decoded::Json(value) => {
                debug!(%peer, device = %record.device_id, "udp datagram: {value}")
            }
            Decoded::Raw(text) => {
                debug!(%peer, device = %record.device_id, "udp raw datagram: {text:?}")
            }
        }
        if let Err(e) = socket.send_to(ack.as_bytes(), peer).await {
            warn!(%peer, "failed to ack datagram: {e}");
        }
    }
}

/// Operator-side half of the channel: opens a transient socket per command,
/// sends one datagram, and waits for exactly one reply within the bound.
///
/// The wire format has no request id, so replies correlate with requests
/// only by address and timing. The sender therefore holds a per-destination
/// lock: a second send to the same address waits for the first to finish,
/// while sends to different addresses run in parallel. No automatic retry;
/// a timeout is the caller's to handle.
pub struct Sender {
    registry: Arc<Registry>,
    control_port: u16,
    default_timeout: Duration,
    in_flight: DashMap<SocketAddr, Arc<Mutex<()>>>,
}

impl Sender {
    pub fn new(registry: Arc<Registry>, control_port: u16, default_timeout: Duration) -> Self {
        Self {
            registry,
            control_port,
            default_timeout,
            in_flight: DashMap::new(),
        }
    }

    pub async fn send(
        &self,
        addr: SocketAddr,
        command: &CommandEnvelope,
    ) -> Result<Decoded, UdpError> {
        let payload = proto::encode(command)?;
        self.exchange(addr, payload, self.default_timeout).await
    }

    /// Sends an arbitrary JSON value; the provisioning handshake uses this
    /// for its step envelopes, with its own (longer) timeout.
    pub async fn send_json(
        &self,
        addr: SocketAddr,
        value: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Decoded, UdpError> {
        self.exchange(addr, value.to_string().into_bytes(), timeout)
            .await
    }

    /// Resolves a registry device id to its last-known address, sends, and
    /// touches the record on a successful round-trip.
    pub async fn send_to_device(
        &self,
        device_id: &str,
        command: &CommandEnvelope,
    ) -> Result<Decoded, UdpError> {
        let record = self
            .registry
            .get(device_id)
            .ok_or_else(|| UdpError::DeviceUnknown(device_id.to_string()))?;
        let ip = record
            .address
            .ok_or_else(|| UdpError::AddressUnknown(device_id.to_string()))?;
        let reply = self
            .send(SocketAddr::new(ip, self.control_port), command)
            .await?;
        self.registry.touch(device_id);
        Ok(reply)
    }

    async fn exchange(
        &self,
        addr: SocketAddr,
        payload: Vec<u8>,
        bound: Duration,
    ) -> Result<Decoded, UdpError> {
        let lock = self
            .in_flight
            .entry(addr)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _outstanding = lock.lock().await;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&payload, addr).await?;

        let mut buf = vec![0u8; 4096];
        let (len, from) = timeout(bound, socket.recv_from(&mut buf))
            .await
            .map_err(|_| UdpError::Timeout {
                addr,
                timeout: bound,
            })??;
        debug!(%addr, %from, len, "udp reply received");
        Ok(proto::decode(&buf[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn sender() -> Sender {
        let registry = Arc::new(Registry::new(StdDuration::from_secs(300)));
        Sender::new(registry, 9080, Duration::from_millis(500))
    }

    /// A scripted bulb: answers every datagram with the given bytes.
    async fn fake_bulb(reply: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(reply, peer).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_returns_decoded_json_reply() {
        let addr = fake_bulb(br#"{"result":{"ret":0}}"#).await;
        let reply = sender()
            .send(addr, &CommandEnvelope::set_switch(true))
            .await
            .unwrap();
        assert_eq!(reply.ret_code(), Some(0));
    }

    #[tokio::test]
    async fn bare_token_reply_surfaces_as_raw_not_error() {
        let addr = fake_bulb(b"OK").await;
        let reply = sender()
            .send(addr, &CommandEnvelope::get_device_info())
            .await
            .unwrap();
        assert_eq!(reply, Decoded::Raw("OK".to_string()));
    }

    #[tokio::test]
    async fn dead_address_times_out_instead_of_hanging() {
        // Bind then drop to get a port with nothing listening.
        let dead = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };
        let result = sender()
            .send(dead, &CommandEnvelope::get_device_info())
            .await;
        assert!(matches!(result, Err(UdpError::Timeout { .. })));
    }

    #[tokio::test]
    async fn unknown_device_id_is_a_distinct_error() {
        let result = sender()
            .send_to_device("never-seen", &CommandEnvelope::get_device_info())
            .await;
        assert!(matches!(result, Err(UdpError::DeviceUnknown(_))));
    }

    #[tokio::test]
    async fn sends_to_the_same_address_are_serialized() {
        let addr = fake_bulb(br#"{"result":{"ret":0}}"#).await;
        let sender = Arc::new(sender());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sender = sender.clone();
            handles.push(tokio::spawn(async move {
                sender.send(addr, &CommandEnvelope::set_switch(false)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
