//! Event dispatcher
//!
//! Decodes inbound frames, works out which conversation each one targets and
//! drops everything aimed at a room this client has not joined.

use crate::presence::PresenceManager;
use crate::protocol::{decode_frame, ChatEvent};

/// A decoded event bound to a joined conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub conversation_id: String,
    pub stream_id: Option<String>,
    pub event: ChatEvent,
}

/// Routes frames from the ordered inbound path
#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Conversation of the most recent `StartStream`
    command_context: Option<String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the conversation a stream was just started for
    pub fn note_stream_started(&mut self, conversation_id: &str) {
        self.command_context = Some(conversation_id.to_string());
    }

    /// Forget the inferred target if it points at `conversation_id`
    pub fn forget(&mut self, conversation_id: &str) {
        if self.command_context.as_deref() == Some(conversation_id) {
            self.command_context = None;
        }
    }

    pub fn command_context(&self) -> Option<&str> {
        self.command_context.as_deref()
    }

    /// Decode `raw` and bind it to a joined conversation.
    ///
    /// Malformed frames, frames with no resolvable target and frames for
    /// rooms that are not joined all return `None`.
    pub fn dispatch(&self, raw: &str, presence: &PresenceManager) -> Option<Dispatched> {
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "Dropping malformed frame");
                return None;
            }
        };

        if let ChatEvent::Error {
            diagnostic: Some(diagnostic),
            ..
        } = &frame.event
        {
            tracing::warn!(frame_type = %diagnostic.frame_type, "Unrecognized frame type");
        }

        let Some(conversation_id) = frame.conversation_id.or_else(|| self.command_context.clone()) else {
            tracing::debug!(kind = frame.event.kind(), "Frame has no target conversation");
            return None;
        };

        if !presence.is_joined(&conversation_id) {
            tracing::trace!(conv_id = %conversation_id, kind = frame.event.kind(), "Frame for unjoined room dropped");
            return None;
        }

        Some(Dispatched {
            conversation_id,
            stream_id: frame.stream_id,
            event: frame.event,
        })
    }
}
