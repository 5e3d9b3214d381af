//! Provisioning wire types: the step envelope a factory-mode bulb answers
//! and the RC4 + base64 setup-parameter payload.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rc4;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("setup key must not be empty")]
    EmptyKey,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The ordered steps of the setup handshake, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    StartConfig,
    ScanWifi,
    GetApList,
    SetParams,
    EndConfig,
}

impl SetupStep {
    pub fn wire_name(self) -> &'static str {
        match self {
            SetupStep::StartConfig => "startConfigRequest",
            SetupStep::ScanWifi => "scanWifiRequest",
            SetupStep::GetApList => "getAPListRequest",
            SetupStep::SetParams => "setParamsRequest",
            SetupStep::EndConfig => "endConfigRequest",
        }
    }
}

/// Envelope for one provisioning request. The firmware expects the step
/// counters even though every observed exchange is a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupEnvelope {
    pub name: String,
    #[serde(rename = "totalStep")]
    pub total_step: u32,
    #[serde(rename = "curStep")]
    pub cur_step: u32,
    pub payload: Value,
}

impl SetupEnvelope {
    pub fn step(step: SetupStep, payload: Value) -> Self {
        Self {
            name: step.wire_name().to_string(),
            total_step: 1,
            cur_step: 1,
            payload,
        }
    }
}

/// WiFi credentials and server addresses handed to the bulb, pre-encryption.
/// Field names are what the firmware parses; do not rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupParams {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "appServerDomain")]
    pub app_server_domain: String,
    #[serde(rename = "jbalancerDomain")]
    pub jbalancer_domain: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
    #[serde(rename = "routerInfo")]
    pub router_info: RouterInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    pub ssid: String,
    pub password: String,
}

/// Serializes `params` to JSON, encrypts with RC4 under `key`, and
/// base64-encodes the result. Deterministic for a fixed key and params:
/// RC4 carries no IV and the firmware decrypts with the same static key,
/// so no nonce may be added here.
pub fn encrypt_setup_payload(params: &SetupParams, key: &[u8]) -> Result<String, PayloadError> {
    if key.is_empty() {
        return Err(PayloadError::EmptyKey);
    }
    let plaintext = serde_json::to_vec(params)?;
    Ok(STANDARD.encode(rc4::apply(key, &plaintext)))
}

/// Inverse of [`encrypt_setup_payload`]; used by tests and diagnostics.
pub fn decrypt_setup_payload(encoded: &str, key: &[u8]) -> Result<SetupParams, PayloadError> {
    if key.is_empty() {
        return Err(PayloadError::EmptyKey);
    }
    let ciphertext = STANDARD.decode(encoded)?;
    Ok(serde_json::from_slice(&rc4::apply(key, &ciphertext))?)
}

/// The `payload.result` flag of a step reply, when present.
pub fn step_result(reply: &Value) -> Option<bool> {
    reply.get("payload")?.get("result")?.as_bool()
}

/// The device MAC reported in a `startConfigRequest` reply.
pub fn step_mac(reply: &Value) -> Option<&str> {
    reply.get("payload")?.get("mac")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_params() -> SetupParams {
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

    #[test]
    fn setup_payload_round_trips() {
        let key = b"SengledSetupKey123";
        let params = sample_params();
        let encoded = encrypt_setup_payload(&params, key).unwrap();
        assert_eq!(decrypt_setup_payload(&encoded, key).unwrap(), params);
    }

    #[test]
    fn encryption_is_deterministic() {
        let key = b"SengledSetupKey123";
        let params = sample_params();
        assert_eq!(
            encrypt_setup_payload(&params, key).unwrap(),
            encrypt_setup_payload(&params, key).unwrap()
        );
    }

    #[test]
    fn wrong_key_does_not_decrypt() {
        let encoded = encrypt_setup_payload(&sample_params(), b"right-key").unwrap();
        assert!(decrypt_setup_payload(&encoded, b"wrong-key").is_err());
    }

    #[test]
    fn empty_key_is_an_error() {
        assert!(matches!(
            encrypt_setup_payload(&sample_params(), b""),
            Err(PayloadError::EmptyKey)
        ));
    }

    #[test]
    fn params_use_firmware_field_names() {
        let value = serde_json::to_value(sample_params()).unwrap();
        assert!(value.get("userID").is_some());
        assert!(value.get("appServerDomain").is_some());
        assert!(value.get("jbalancerDomain").is_some());
        assert!(value.get("timeZone").is_some());
        assert_eq!(value["routerInfo"]["ssid"], "home");
    }

    #[test]
    fn envelope_uses_camel_case_step_counters() {
        let envelope = SetupEnvelope::step(SetupStep::StartConfig, json!({"protocol": 1}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["name"], "startConfigRequest");
        assert_eq!(value["totalStep"], 1);
        assert_eq!(value["curStep"], 1);
        assert_eq!(value["payload"]["protocol"], 1);
    }

    #[test]
    fn step_reply_accessors() {
        let reply = json!({"payload": {"result": true, "mac": "AA:BB:CC:DD:EE:FF"}});
        assert_eq!(step_result(&reply), Some(true));
        assert_eq!(step_mac(&reply), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(step_result(&json!({"payload": {}})), None);
    }
}
