//! Outbound commands and their wire encoding

use super::{COMMAND_JOIN, COMMAND_LEAVE, COMMAND_STOP, COMMAND_STREAM, COMMAND_TYPING};
use crate::state_machine::SessionId;
use serde_json::json;

/// Kind of user-initiated action sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartStream,
    Stop,
    Typing,
    Join,
    Leave,
}

impl CommandKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            CommandKind::StartStream => COMMAND_STREAM,
            CommandKind::Stop => COMMAND_STOP,
            CommandKind::Typing => COMMAND_TYPING,
            CommandKind::Join => COMMAND_JOIN,
            CommandKind::Leave => COMMAND_LEAVE,
        }
    }
}

/// Command-specific data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    None,
    Message { text: String, stream_id: SessionId },
    Typing { is_typing: bool },
}

/// A command waiting to be written to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub conversation_id: String,
    pub payload: CommandPayload,
}

impl PendingCommand {
    pub fn start_stream(conversation_id: impl Into<String>, text: impl Into<String>, stream_id: SessionId) -> Self {
        Self {
            kind: CommandKind::StartStream,
            conversation_id: conversation_id.into(),
            payload: CommandPayload::Message {
                text: text.into(),
                stream_id,
            },
        }
    }

    pub fn stop(conversation_id: impl Into<String>) -> Self {
        Self::bare(CommandKind::Stop, conversation_id)
    }

    pub fn typing(conversation_id: impl Into<String>, is_typing: bool) -> Self {
        Self {
            kind: CommandKind::Typing,
            conversation_id: conversation_id.into(),
            payload: CommandPayload::Typing { is_typing },
        }
    }

    pub fn join(conversation_id: impl Into<String>) -> Self {
        Self::bare(CommandKind::Join, conversation_id)
    }

    pub fn leave(conversation_id: impl Into<String>) -> Self {
        Self::bare(CommandKind::Leave, conversation_id)
    }

    fn bare(kind: CommandKind, conversation_id: impl Into<String>) -> Self {
        Self {
            kind,
            conversation_id: conversation_id.into(),
            payload: CommandPayload::None,
        }
    }

    /// Encode as a text frame
    pub fn to_frame(&self) -> String {
        let data = match &self.payload {
            CommandPayload::None => json!({ "conversationId": self.conversation_id }),
            CommandPayload::Message { text, stream_id } => json!({
                "message": text,
                "conversationId": self.conversation_id,
                "streamId": stream_id.to_string(),
            }),
            CommandPayload::Typing { is_typing } => json!({
                "conversationId": self.conversation_id,
                "isTyping": is_typing,
            }),
        };

        json!({ "event": self.kind.wire_name(), "data": data }).to_string()
    }
}
