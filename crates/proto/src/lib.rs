//! Wire codec for the vendor bulb protocol.
//!
//! Two shapes travel over UDP: the steady-state command envelope
//! (`{"func": ..., "param": {...}}`) exchanged with an already-joined bulb,
//! and the provisioning envelope used while a bulb is still in factory AP
//! mode (see [`setup`]). One datagram carries exactly one envelope; there is
//! no framing and no request id on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub mod rc4;
pub mod setup;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize command: {0}")]
    Json(#[from] serde_json::Error),
}

/// One UDP request or reply in the steady-state control protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub func: String,
    #[serde(default)]
    pub param: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            param: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.param.insert(key.into(), value.into());
        self
    }

    /// Ask the bulb for its identity and current attribute values.
    pub fn get_device_info() -> Self {
        Self::new("get_device_info")
    }

    pub fn set_switch(on: bool) -> Self {
        Self::new("set_device_switch").with_param("switch", if on { 1 } else { 0 })
    }

    /// Brightness is a percentage; the firmware clamps on its side but we
    /// keep requests in range anyway.
    pub fn set_brightness(percent: u8) -> Self {
        Self::new("set_device_brightness").with_param("brightness", percent.min(100))
    }

    pub fn set_color_temperature(kelvin: u32) -> Self {
        Self::new("set_device_color_temperature").with_param("colorTemperature", kelvin)
    }
}

/// What came back in a datagram.
///
/// Some firmware revisions answer certain functions with a bare status token
/// instead of JSON, so a failed parse is a legitimate reply shape rather
/// than an error. Callers branch on the two variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Json(Value),
    Raw(String),
}

impl Decoded {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Decoded::Json(value) => Some(value),
            Decoded::Raw(_) => None,
        }
    }

    /// The `result.ret` code of a reply, when present. Zero means success.
    pub fn ret_code(&self) -> Option<i64> {
        self.as_json()?.get("result")?.get("ret")?.as_i64()
    }
}

pub fn encode(envelope: &CommandEnvelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Decoded {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Decoded::Json(value),
        Err(_) => Decoded::Raw(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// The generic acknowledgement the listener answers every datagram with.
pub fn ack_reply() -> Value {
    json!({"result": {"ret": 0}})
}
