//! The setup handshake run against a bulb in factory AP mode.
//!
//! A strict forward-only sequence: each step sends one UDP request and
//! blocks on its reply. A timeout or an explicit failure flag abandons the
//! session; there is no automatic retry, the operator restarts from the
//! beginning if they want another attempt. On success the bulb reboots,
//! joins the configured WiFi, and calls our registration endpoint.

use filament_proto::setup::{self, SetupEnvelope, SetupParams, SetupStep};
use filament_proto::Decoded;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::udp::{Sender, UdpError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    ConfigStarted,
    WifiScanned,
    ApListed,
    ParamsSent,
    ConfigEnded,
    Complete,
    Failed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("{step} rejected by device: {reason}")]
    Step { step: &'static str, reason: String },
    #[error("{step} timed out waiting for the device")]
    Timeout { step: &'static str },
    #[error("{step} transport error: {source}")]
    Udp {
        step: &'static str,
        #[source]
        source: UdpError,
    },
}

#[derive(Debug, Serialize)]
pub struct StepOutcome {
    pub step: &'static str,
    pub reached: Stage,
    /// Informational reply payload, e.g. the AP list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct HandshakeReport {
    pub stage: Stage,
    /// MAC learned from the first startConfigRequest reply; identifies the
    /// device for the rest of the session.
    pub mac: String,
    pub steps: Vec<StepOutcome>,
}

pub struct Handshake<'a> {
    sender: &'a Sender,
    target: SocketAddr,
    step_timeout: Duration,
    /// How long the bulb gets to finish its WiFi scan before we ask for
    /// the AP list.
    scan_settle: Duration,
    stage: Stage,
}

impl<'a> Handshake<'a> {
    pub fn new(sender: &'a Sender, target: SocketAddr, step_timeout: Duration) -> Self {
        Self {
            sender,
            target,
            step_timeout,
            scan_settle: Duration::from_secs(3),
            stage: Stage::Init,
        }
    }

    pub fn with_scan_settle(mut self, scan_settle: Duration) -> Self {
        self.scan_settle = scan_settle;
        self
    }

    pub async fn run(
        mut self,
        params: &SetupParams,
        key: &[u8],
    ) -> Result<HandshakeReport, HandshakeError> {
        let mut steps = Vec::new();
        match self.drive(params, key, &mut steps).await {
            Ok(mac) => {
                info!(target_addr = %self.target, %mac, "provisioning complete; device should reboot onto the configured network");
                Ok(HandshakeReport {
                    stage: Stage::Complete,
                    mac,
                    steps,
                })
            }
            Err(e) => {
                self.stage = Stage::Failed;
                warn!(target_addr = %self.target, "provisioning failed: {e}");
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        params: &SetupParams,
        key: &[u8],
        steps: &mut Vec<StepOutcome>,
    ) -> Result<String, HandshakeError> {
        // Step 1: open the configuration session and learn the MAC.
        let reply = self
            .exchange(SetupStep::StartConfig, json!({"protocol": 1}))
            .await?;
        if !setup::step_result(&reply).unwrap_or(false) {
            return Err(HandshakeError::Step {
                step: SetupStep::StartConfig.wire_name(),
                reason: "device refused to start configuration".to_string(),
            });
        }
        let mac = setup::step_mac(&reply)
            .ok_or_else(|| HandshakeError::Step {
                step: SetupStep::StartConfig.wire_name(),
                reason: "reply carried no MAC".to_string(),
            })?
            .to_string();
        self.advance(Stage::ConfigStarted, SetupStep::StartConfig, None, steps);

        // Step 2: kick off the WiFi scan. Fire-and-forget, since a silent
        // bulb here is still scanning, not broken. Then give it time to
        // finish.
        match self.exchange(SetupStep::ScanWifi, json!({})).await {
            Ok(_) | Err(HandshakeError::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }
        self.advance(Stage::WifiScanned, SetupStep::ScanWifi, None, steps);
        tokio::time::sleep(self.scan_settle).await;

        // Step 3: fetch the AP list. Informational only, but a missing
        // reply means the bulb is gone.
        let ap_reply = self.exchange(SetupStep::GetApList, json!({})).await?;
        self.advance(
            Stage::ApListed,
            SetupStep::GetApList,
            Some(ap_reply),
            steps,
        );

        // The firmware wants the config session re-opened before it will
        // accept parameters.
        let _ = self
            .exchange(SetupStep::StartConfig, json!({"protocol": 1}))
            .await?;

        // Step 4: the encrypted WiFi/server parameters.
        let encrypted =
            setup::encrypt_setup_payload(params, key).map_err(|e| HandshakeError::Step {
                step: SetupStep::SetParams.wire_name(),
                reason: e.to_string(),
            })?;
        let reply = self
            .exchange(SetupStep::SetParams, Value::String(encrypted))
            .await?;
        if setup::step_result(&reply) == Some(false) {
            return Err(HandshakeError::Step {
                step: SetupStep::SetParams.wire_name(),
                reason: "device rejected the setup parameters".to_string(),
            });
        }
        self.advance(Stage::ParamsSent, SetupStep::SetParams, None, steps);

        // Step 5: close the session; result=true means credentials stuck.
        let reply = self.exchange(SetupStep::EndConfig, json!({})).await?;
        if !setup::step_result(&reply).unwrap_or(false) {
            return Err(HandshakeError::Step {
                step: SetupStep::EndConfig.wire_name(),
                reason: "device reported failure ending configuration".to_string(),
            });
        }
        self.advance(Stage::ConfigEnded, SetupStep::EndConfig, None, steps);

        Ok(mac)
    }

    async fn exchange(
        &mut self,
        step: SetupStep,
        payload: Value,
    ) -> Result<Value, HandshakeError> {
        let envelope = SetupEnvelope::step(step, payload);
        let value = serde_json::to_value(&envelope).map_err(|e| HandshakeError::Step {
            step: step.wire_name(),
            reason: format!("failed to build request: {e}"),
        })?;
        debug!(target_addr = %self.target, step = step.wire_name(), "sending provisioning step");
        match self
            .sender
            .send_json(self.target, &value, self.step_timeout)
            .await
        {
            Ok(Decoded::Json(reply)) => Ok(reply),
            Ok(Decoded::Raw(text)) => Err(HandshakeError::Step {
                step: step.wire_name(),
                reason: format!("unparseable reply: {text:?}"),
            }),
            Err(UdpError::Timeout { .. }) => Err(HandshakeError::Timeout {
                step: step.wire_name(),
            }),
            Err(source) => Err(HandshakeError::Udp {
                step: step.wire_name(),
                source,
            }),
        }
    }

    fn advance(
        &mut self,
        stage: Stage,
        step: SetupStep,
        detail: Option<Value>,
        steps: &mut Vec<StepOutcome>,
    ) {
        self.stage = stage;
        steps.push(StepOutcome {
            step: step.wire_name(),
            reached: stage,
            detail,
        });
    }
}
