//! Wire protocol for the chat backend
//!
//! Frames travel as `{"event": "<type>", "data": {...}}` in both directions.

pub mod inbound;
pub mod outbound;

pub use inbound::{decode_frame, ChatEvent, DecodeError, FollowUpQuestion, FrameDiagnostic, InboundFrame};
pub use outbound::{CommandKind, CommandPayload, PendingCommand};

pub const EVENT_CHUNK: &str = "chat:chunk";
pub const EVENT_COMPLETE: &str = "chat:complete";
pub const EVENT_ERROR: &str = "chat:error";
pub const EVENT_TYPING: &str = "chat:typing";
pub const EVENT_STOPPED: &str = "chat:stopped";

pub const COMMAND_STREAM: &str = "chat:stream";
pub const COMMAND_STOP: &str = "chat:stop";
pub const COMMAND_TYPING: &str = "chat:typing";
pub const COMMAND_JOIN: &str = "chat:join";
pub const COMMAND_LEAVE: &str = "chat:leave";
