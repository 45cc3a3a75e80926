//! Inbound frames and their typed decoding

use super::{EVENT_CHUNK, EVENT_COMPLETE, EVENT_ERROR, EVENT_STOPPED, EVENT_TYPING};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Follow-up question suggested by the backend after a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub question: String,
}

impl FollowUpQuestion {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
        }
    }
}

/// Domain event decoded from an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Chunk {
        content: String,
        seq: u64,
        /// Advisory flag from the backend; completion only comes from `Complete`
        is_complete: bool,
    },
    Complete {
        content: String,
        follow_up_questions: Vec<FollowUpQuestion>,
        title: Option<String>,
    },
    Error {
        message: String,
        /// Set when the frame type was not recognised
        diagnostic: Option<FrameDiagnostic>,
    },
    Typing {
        is_typing: bool,
    },
    Stopped,
}

impl ChatEvent {
    /// Wire name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Chunk { .. } => EVENT_CHUNK,
            ChatEvent::Complete { .. } => EVENT_COMPLETE,
            ChatEvent::Error { .. } => EVENT_ERROR,
            ChatEvent::Typing { .. } => EVENT_TYPING,
            ChatEvent::Stopped => EVENT_STOPPED,
        }
    }

    /// Whether this is a diagnostic for an unrecognised frame
    pub fn is_protocol_diagnostic(&self) -> bool {
        matches!(self, ChatEvent::Error { diagnostic: Some(_), .. })
    }
}

/// Diagnostic details for a frame whose type is outside the known set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDiagnostic {
    pub frame_type: String,
}

/// A decoded frame with its routing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Explicit target conversation, if the payload named one
    pub conversation_id: Option<String>,
    /// Generation token echoed by the backend, if any
    pub stream_id: Option<String>,
    pub event: ChatEvent,
}

/// Frames that could not be decoded at all
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Frame is not valid JSON: {0}")]
    Json(String),
    #[error("Frame has no event type")]
    MissingType,
    #[error("Invalid {frame_type} payload: {reason}")]
    Payload { frame_type: String, reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Envelope {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Socket.IO style `["chat:chunk", {...}]`
    Array(Vec<Value>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Routing {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    stream_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkPayload {
    content: String,
    chunk_number: u64,
    #[serde(default)]
    is_complete: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletePayload {
    content: String,
    #[serde(default)]
    follow_up_questions: Vec<FollowUpQuestion>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    is_typing: bool,
}

/// Decode a raw text frame into a typed event.
///
/// Unknown frame types decode successfully into `ChatEvent::Error` carrying a
/// `FrameDiagnostic`; only unparseable frames return `DecodeError`.
pub fn decode_frame(raw: &str) -> Result<InboundFrame, DecodeError> {
    let frame: RawFrame = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;

    let (frame_type, data) = match frame {
        RawFrame::Envelope { event, data } => (event, data),
        RawFrame::Array(mut items) => {
            if items.is_empty() {
                return Err(DecodeError::MissingType);
            }
            let data = if items.len() > 1 { items.swap_remove(1) } else { Value::Null };
            match items.swap_remove(0) {
                Value::String(event) => (event, data),
                _ => return Err(DecodeError::MissingType),
            }
        }
    };

    if frame_type.is_empty() {
        return Err(DecodeError::MissingType);
    }

    // `chat:stopped` and friends may arrive with no payload at all
    let data = if data.is_null() { Value::Object(serde_json::Map::new()) } else { data };

    let routing: Routing = serde_json::from_value(data.clone()).unwrap_or_default();

    let event = match frame_type.as_str() {
        EVENT_CHUNK => {
            let p: ChunkPayload = parse_payload(&frame_type, data)?;
            ChatEvent::Chunk {
                content: p.content,
                seq: p.chunk_number,
                is_complete: p.is_complete,
            }
        }
        EVENT_COMPLETE => {
            let p: CompletePayload = parse_payload(&frame_type, data)?;
            ChatEvent::Complete {
                content: p.content,
                follow_up_questions: p.follow_up_questions,
                title: p.title.filter(|t| !t.trim().is_empty()),
            }
        }
        EVENT_ERROR => {
            let p: ErrorPayload = parse_payload(&frame_type, data)?;
            ChatEvent::Error {
                message: p.error,
                diagnostic: None,
            }
        }
        EVENT_TYPING => {
            let p: TypingPayload = parse_payload(&frame_type, data)?;
            ChatEvent::Typing { is_typing: p.is_typing }
        }
        EVENT_STOPPED => ChatEvent::Stopped,
        other => ChatEvent::Error {
            message: format!("Unrecognized frame type: {other}"),
            diagnostic: Some(FrameDiagnostic {
                frame_type: other.to_string(),
            }),
        },
    };

    Ok(InboundFrame {
        conversation_id: routing.conversation_id.filter(|id| !id.is_empty()),
        stream_id: routing.stream_id.filter(|id| !id.is_empty()),
        event,
    })
}

fn parse_payload<T: for<'de> Deserialize<'de>>(frame_type: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::Payload {
        frame_type: frame_type.to_string(),
        reason: e.to_string(),
    })
}

/// Backends disagree on whether question ids are strings or integers
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
