//! Handshake tests against a scripted factory-mode bulb on localhost.

use filament_proto::setup::{self, RouterInfo, SetupParams};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use filament_bridge::provisioning::{Handshake, HandshakeError, Stage};
use filament_bridge::registry::Registry;
use filament_bridge::udp::Sender;

const KEY: &[u8] = b"SengledSetupKey123";
const MAC: &str = "B0:CE:18:C9:70:01";

#[derive(Default)]
struct BulbScript {
    /// Step names in the order the bulb heard them.
    received: Vec<String>,
    /// The encrypted payload captured from setParamsRequest.
    params_payload: Option<String>,
}

/// A fake bulb in setup mode. Answers each step the way real firmware
/// does; `refuse_start` makes the first reply carry result=false.
async fn fake_bulb(refuse_start: bool) -> (SocketAddr, Arc<Mutex<BulbScript>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let script = Arc::new(Mutex::new(BulbScript::default()));
    let shared = script.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
            let name = request["name"].as_str().unwrap_or_default().to_string();
            shared.lock().received.push(name.clone());

            let reply = match name.as_str() {
                "startConfigRequest" => {
                    json!({"payload": {"result": !refuse_start, "mac": MAC}})
                }
                "scanWifiRequest" => json!({"payload": {"result": true}}),
                "getAPListRequest" => {
                    json!({"payload": {"result": true, "routerList": [{"ssid": "home"}]}})
                }
                "setParamsRequest" => {
                    shared.lock().params_payload =
                        request["payload"].as_str().map(str::to_string);
                    json!({"payload": {"result": true}})
                }
                "endConfigRequest" => json!({"payload": {"result": true}}),
                _ => json!({"payload": {"result": false}}),
            };
            socket
                .send_to(reply.to_string().as_bytes(), peer)
                .await
                .unwrap();
        }
    });

    (addr, script)
}

fn sender() -> Sender {
    let registry = Arc::new(Registry::new(Duration::from_secs(300)));
    Sender::new(registry, 9080, Duration::from_millis(500))
}

fn params() -> SetupParams {
    SetupParams {
        user_id: "618".to_string(),
        app_server_domain: "http://192.168.1.100:80/life2/device/accessCloud.json".to_string(),
        jbalancer_domain: "http://192.168.1.100:80/jbalancer/new/bimqtt".to_string(),
        time_zone: "America/Chicago".to_string(),
        router_info: RouterInfo {
            ssid: "home".to_string(),
            password: "hunter2".to_string(),
        },
    }
}

#[tokio::test]
async fn full_handshake_completes_and_delivers_decryptable_params() {
    let (addr, script) = fake_bulb(false).await;
    let sender = sender();

    let report = Handshake::new(&sender, addr, Duration::from_millis(500))
        .with_scan_settle(Duration::ZERO)
        .run(&params(), KEY)
        .await
        .unwrap();

    assert_eq!(report.stage, Stage::Complete);
    assert_eq!(report.mac, MAC);

    let script = script.lock();
    assert_eq!(
        script.received,
        vec![
            "startConfigRequest",
            "scanWifiRequest",
            "getAPListRequest",
            "startConfigRequest",
            "setParamsRequest",
            "endConfigRequest",
        ]
    );

    // What the bulb received decrypts, with the shared key, to exactly
    // what the operator asked for.
    let delivered =
        setup::decrypt_setup_payload(script.params_payload.as_ref().unwrap(), KEY).unwrap();
    assert_eq!(delivered, params());
}

#[tokio::test]
async fn stages_only_move_forward() {
    let (addr, _script) = fake_bulb(false).await;
    let sender = sender();

    let report = Handshake::new(&sender, addr, Duration::from_millis(500))
        .with_scan_settle(Duration::ZERO)
        .run(&params(), KEY)
        .await
        .unwrap();

    let reached: Vec<Stage> = report.steps.iter().map(|s| s.reached).collect();
    let mut sorted = reached.clone();
    sorted.dedup();
    assert_eq!(reached, sorted, "a stage was revisited");
    for pair in reached.windows(2) {
        assert!(
            (pair[0] as u8) < (pair[1] as u8),
            "stage went backwards: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn refused_start_fails_before_any_scan_is_requested() {
    let (addr, script) = fake_bulb(true).await;
    let sender = sender();

    let result = Handshake::new(&sender, addr, Duration::from_millis(500))
        .with_scan_settle(Duration::ZERO)
        .run(&params(), KEY)
        .await;

    match result {
        Err(HandshakeError::Step { step, .. }) => assert_eq!(step, "startConfigRequest"),
        other => panic!("expected a step failure, got {other:?}"),
    }
    assert_eq!(script.lock().received, vec!["startConfigRequest"]);
}

#[tokio::test]
async fn silent_target_times_out_rather_than_hanging() {
    let dead = {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    };
    let sender = sender();

    let result = Handshake::new(&sender, dead, Duration::from_millis(200))
        .with_scan_settle(Duration::ZERO)
        .run(&params(), KEY)
        .await;

    match result {
        Err(HandshakeError::Timeout { step }) => assert_eq!(step, "startConfigRequest"),
        other => panic!("expected a timeout, got {other:?}"),
    }
}
