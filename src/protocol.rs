//! Wire protocol for the classifier socket.
//!
//! Every message is a flat JSON object sent as one text frame. Outgoing
//! messages are tagged with `type`; incoming messages are discriminated by
//! `type == "pong"` first and then by `status`, with anything unrecognised
//! treated as a stats snapshot.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Substring the server uses for its noisy, non-fatal serialization errors
pub const NOISY_ERROR_MARKER: &str = "JSON serializable";

pub const DEFAULT_FRAMES_NEEDED: u32 = 16;
pub const DEFAULT_MOTION_THRESHOLD: f64 = 0.000001;
pub const DEFAULT_STATUS: &str = "waiting";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        timestamp: i64,
    },
    Frame {
        data: String,
        timestamp: i64,
        format: String,
        size_kb: u64,
        dimensions: String,
    },
    AdjustThreshold {
        factor: f64,
    },
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn adjust_threshold(factor: f64) -> Self {
        ClientMessage::AdjustThreshold { factor }
    }

    /// Build a frame message from an already encoded payload
    pub fn frame(payload: EncodedFrame) -> Self {
        ClientMessage::Frame {
            size_kb: payload.size_kb.round() as u64,
            dimensions: format!("{}x{}", payload.width, payload.height),
            data: payload.data,
            timestamp: now_millis(),
            format: "jpeg".to_string(),
        }
    }

    /// Serialize to the text frame sent on the socket
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A JPEG frame after base64 encoding, with its estimated decoded size
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: String,
    pub size_kb: f64,
    pub width: u32,
    pub height: u32,
}

impl EncodedFrame {
    pub fn new(jpeg: &[u8], width: u32, height: u32) -> Self {
        let data = STANDARD.encode(jpeg);
        let size_kb = data.len() as f64 * 0.75 / 1024.0;
        Self {
            data,
            size_kb,
            width,
            height,
        }
    }
}

/// Incremental server state, replaced wholesale on every stats message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    pub frames_collected: u32,
    pub frames_needed: u32,
    pub motion_detected: bool,
    pub motion_score: f64,
    pub motion_threshold: f64,
    pub status: String,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            frames_collected: 0,
            frames_needed: DEFAULT_FRAMES_NEEDED,
            motion_detected: false,
            motion_score: 0.0,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            status: DEFAULT_STATUS.to_string(),
        }
    }
}

impl ServerStats {
    /// Coerce every field independently, falling back to its default
    fn from_object(obj: &Map<String, Value>) -> Self {
        let defaults = ServerStats::default();
        Self {
            frames_collected: coerce_u32(obj.get("frames_collected"))
                .unwrap_or(defaults.frames_collected),
            // Zero falls back to the default, like a missing value
            frames_needed: coerce_u32(obj.get("frames_needed"))
                .filter(|&n| n != 0)
                .unwrap_or(defaults.frames_needed),
            motion_detected: coerce_bool(obj.get("motion_detected"))
                .unwrap_or(defaults.motion_detected),
            motion_score: coerce_f64(obj.get("motion_score")).unwrap_or(defaults.motion_score),
            motion_threshold: coerce_f64(obj.get("motion_threshold"))
                .filter(|&t| t != 0.0)
                .unwrap_or(defaults.motion_threshold),
            status: coerce_string(obj.get("status")).unwrap_or(defaults.status),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f64,
    pub above_threshold: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub message: String,
}

impl ServerError {
    /// Known noisy error class that is logged but never shown to the user
    pub fn is_noise(&self) -> bool {
        self.message.contains(NOISY_ERROR_MARKER)
    }
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pong,
    Prediction(PredictionResult),
    Error(ServerError),
    Stats(ServerStats),
}

impl ServerMessage {
    /// Decode one text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let obj = match &value {
            Value::Object(obj) => obj,
            other => return Err(ProtocolError::NotAnObject(json_kind(other))),
        };

        if obj.get("type").and_then(Value::as_str) == Some("pong") {
            return Ok(ServerMessage::Pong);
        }

        match obj.get("status").and_then(Value::as_str) {
            Some("prediction") => {
                let predicted_class = obj
                    .get("predicted_class")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("predicted_class"))?
                    .to_string();
                let confidence = coerce_f64(obj.get("confidence"))
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                let above_threshold = coerce_bool(obj.get("above_threshold")).unwrap_or(false);
                Ok(ServerMessage::Prediction(PredictionResult {
                    predicted_class,
                    confidence,
                    above_threshold,
                }))
            }
            Some("error") => {
                let message = coerce_string(obj.get("message"))
                    .unwrap_or_else(|| "Unknown server error".to_string());
                Ok(ServerMessage::Error(ServerError { message }))
            }
            _ => Ok(ServerMessage::Stats(ServerStats::from_object(obj))),
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    if let Some(Value::Number(n)) = value {
        if let Some(u) = n.as_u64() {
            return u32::try_from(u).ok();
        }
    }
    let n = coerce_f64(value)?;
    (n >= 0.0 && n <= u32::MAX as f64).then(|| n.trunc() as u32)
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
