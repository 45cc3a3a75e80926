//! Streaming session state machine
//!
//! One `StreamSession` per generation. Transitions mutate only the session
//! and hand back effects; the client performs the I/O afterwards.

mod effect;
pub mod event;
mod registry;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::SessionEvent;
pub use registry::{Applied, SessionRegistry, StartOutcome};
pub use state::{ChunkOutcome, SessionId, StreamSession, StreamStatus};
pub use transition::{transition, TransitionError, TransitionResult};
