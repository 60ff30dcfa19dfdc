//! Message codec
//!
//! Frames exchanged with the external process are tagged JSON envelopes:
//! `{"type": <tag>, "content": <string>}`. Inbound traffic is untrusted, so
//! decoding never panics and reports failures as [`DecodeError`].

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag for frames from the external process asking the host to post a message
pub const SEND_MESSAGE: &str = "send_message";

/// Tag for frames forwarding an assistant-authored message to the external process
pub const BOT_RESPONSE: &str = "bot_response";

/// Tagged payload exchanged in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope tag
    #[serde(rename = "type")]
    pub kind: String,
    /// Message text
    pub content: String,
}

/// Recognized envelope tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// External → host: inject `content` into the conversation
    SendMessage,
    /// Host → external: an assistant message's text
    BotResponse,
    /// Any other tag; ignored by the bridge
    Unknown(String),
}

impl Envelope {
    /// Create an envelope
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// Envelope forwarding an assistant message
    pub fn bot_response(content: impl Into<String>) -> Self {
        Self::new(BOT_RESPONSE, content)
    }

    /// Envelope asking the host to post a message
    pub fn send_message(content: impl Into<String>) -> Self {
        Self::new(SEND_MESSAGE, content)
    }

    /// Classify the tag
    pub fn kind(&self) -> EnvelopeKind {
        match self.kind.as_str() {
            SEND_MESSAGE => EnvelopeKind::SendMessage,
            BOT_RESPONSE => EnvelopeKind::BotResponse,
            other => EnvelopeKind::Unknown(other.to_string()),
        }
    }

    /// Encode this envelope as a text frame
    pub fn encode(&self) -> String {
        encode(&self.kind, &self.content)
    }
}

/// Encode a frame as `{"type": kind, "content": content}`
pub fn encode(kind: &str, content: &str) -> String {
    serde_json::json!({
        "type": kind,
        "content": content,
    })
    .to_string()
}

/// Decode and validate an inbound frame
///
/// # Errors
/// * `DecodeError::MalformedJson` if `raw` is not JSON
/// * `DecodeError::UnrecognizedShape` if `type` or `content` is missing or not a string
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::UnrecognizedShape("payload is not an object".to_string()))?;

    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err(DecodeError::UnrecognizedShape(
                "`type` is not a string".to_string(),
            ))
        }
        None => return Err(DecodeError::UnrecognizedShape("missing `type`".to_string())),
    };

    let content = match object.get("content") {
        Some(Value::String(content)) => content.clone(),
        Some(_) => {
            return Err(DecodeError::UnrecognizedShape(
                "`content` is not a string".to_string(),
            ))
        }
        None => {
            return Err(DecodeError::UnrecognizedShape(
                "missing `content`".to_string(),
            ))
        }
    };

    Ok(Envelope { kind, content })
}
