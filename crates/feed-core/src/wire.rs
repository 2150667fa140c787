use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const TOPIC_SEPARATOR: char = ':';
pub const NEW_TX_ACCEPTED: &str = "network:new_tx_accepted";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame exceeds max size ({size} > {max})")]
    Oversized { size: usize, max: usize },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
}

/// Control frames the client writes on its own behalf.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Ping,
    Pong,
}

pub fn ping_frame() -> String {
    encode_control(ControlFrame::Ping)
}

pub fn encode_control(frame: ControlFrame) -> String {
    serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string())
}

/// A decoded inbound frame. `body` keeps the whole object, `type` included.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    kind: String,
    body: Value,
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn topic(&self) -> &str {
        topic_of(&self.kind)
    }

    /// Part of `type` after the first separator, if any.
    pub fn event(&self) -> Option<&str> {
        self.kind
            .split_once(TOPIC_SEPARATOR)
            .map(|(_, event)| event)
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn is_pong(&self) -> bool {
        self.kind == "pong"
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(T::deserialize(&self.body)?)
    }
}

pub fn topic_of(kind: &str) -> &str {
    match kind.split_once(TOPIC_SEPARATOR) {
        Some((topic, _)) => topic,
        None => kind,
    }
}

pub fn decode_message(text: &str) -> Result<InboundMessage, WireError> {
    decode_message_bounded(text, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_message_bounded(text: &str, max_frame_bytes: usize) -> Result<InboundMessage, WireError> {
    if text.len() > max_frame_bytes {
        return Err(WireError::Oversized {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let body: Value = serde_json::from_str(text)?;
    let Value::Object(map) = &body else {
        return Err(WireError::NotAnObject);
    };
    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WireError::MissingType)?
        .to_string();
    Ok(InboundMessage { kind, body })
}
