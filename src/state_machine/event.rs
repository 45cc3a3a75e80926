//! Events that drive a stream session

use crate::protocol::{ChatEvent, FollowUpQuestion};

/// Events that trigger session transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    // Client events
    Start,
    StopRequested,
    /// `chat:stop` was written to the link
    StopConfirmed,
    /// A newer stream for the same conversation was started
    Superseded,
    ConnectionLost,

    // Backend events
    Chunk {
        content: String,
        seq: u64,
    },
    Complete {
        content: String,
        follow_up_questions: Vec<FollowUpQuestion>,
        title: Option<String>,
    },
    Error {
        message: String,
    },
    Stopped,
}

impl SessionEvent {
    /// Backend event that applies to a session, if any.
    ///
    /// Typing indicators and protocol diagnostics never touch a session.
    pub fn from_chat_event(event: ChatEvent) -> Option<Self> {
        match event {
            ChatEvent::Chunk { content, seq, .. } => Some(SessionEvent::Chunk { content, seq }),
            ChatEvent::Complete {
                content,
                follow_up_questions,
                title,
            } => Some(SessionEvent::Complete {
                content,
                follow_up_questions,
                title,
            }),
            ChatEvent::Error {
                message,
                diagnostic: None,
            } => Some(SessionEvent::Error { message }),
            ChatEvent::Error { diagnostic: Some(_), .. } | ChatEvent::Typing { .. } => None,
            ChatEvent::Stopped => Some(SessionEvent::Stopped),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::StopRequested => "stop_requested",
            SessionEvent::StopConfirmed => "stop_confirmed",
            SessionEvent::Superseded => "superseded",
            SessionEvent::ConnectionLost => "connection_lost",
            SessionEvent::Chunk { .. } => "chunk",
            SessionEvent::Complete { .. } => "complete",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Stopped => "stopped",
        }
    }
}
