//! Session transition function
//!
//! No I/O happens here: the function updates the session and returns the
//! effects the client must perform.

use super::{ChunkOutcome, Effect, SessionEvent, StreamSession, StreamStatus};
use thiserror::Error;

const CONNECTION_LOST_MESSAGE: &str = "Connection lost during generation";

/// Result of a session transition
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TransitionResult {
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    /// Event absorbed without any visible change
    pub fn ignored() -> Self {
        Self::default()
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn is_ignored(&self) -> bool {
        self.effects.is_empty()
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Apply one event to a session.
pub fn transition(session: &mut StreamSession, event: SessionEvent) -> Result<TransitionResult, TransitionError> {
    let status = session.status.clone();

    // Terminal sessions absorb everything, including late Complete/Chunk
    if status.is_terminal() {
        tracing::trace!(
            session_id = %session.id,
            status = status.name(),
            event = event.name(),
            "Event after terminal state ignored"
        );
        return Ok(TransitionResult::ignored());
    }

    match (status, event) {
        // ============================================================
        // Start
        // ============================================================
        (StreamStatus::Idle, SessionEvent::Start) => {
            session.status = StreamStatus::Streaming;
            Ok(TransitionResult::ignored())
        }

        // ============================================================
        // Chunks
        // ============================================================
        (StreamStatus::Streaming, SessionEvent::Chunk { content, seq }) => {
            match session.accept_chunk(seq, content) {
                ChunkOutcome::Duplicate => {
                    tracing::debug!(session_id = %session.id, seq, "Duplicate chunk dropped");
                    Ok(TransitionResult::ignored())
                }
                outcome => {
                    if outcome == ChunkOutcome::Gap {
                        tracing::debug!(session_id = %session.id, seq, "Chunk sequence gap");
                    }
                    Ok(TransitionResult::ignored().with_effect(Effect::PublishPartial {
                        content: session.buffer(),
                    }))
                }
            }
        }

        // Stop already requested, more text is not wanted
        (StreamStatus::Stopping, SessionEvent::Chunk { .. }) => Ok(TransitionResult::ignored()),

        // ============================================================
        // Completion
        // ============================================================
        (
            StreamStatus::Streaming,
            SessionEvent::Complete {
                content,
                follow_up_questions,
                title,
            },
        ) => {
            session.final_content = Some(content.clone());
            session.follow_up_questions.clone_from(&follow_up_questions);
            session.updated_title.clone_from(&title);
            session.status = StreamStatus::Completed;

            Ok(TransitionResult::ignored()
                .with_effect(Effect::completed(content, follow_up_questions, title))
                .with_effect(Effect::Reconcile))
        }

        // ============================================================
        // Cancellation
        // ============================================================
        (StreamStatus::Streaming, SessionEvent::StopRequested) => {
            session.status = StreamStatus::Stopping;
            Ok(TransitionResult::ignored().with_effect(Effect::SendStop))
        }

        (StreamStatus::Stopping, SessionEvent::StopRequested) => Ok(TransitionResult::ignored()),

        // The stop ends the session once written, whether or not the backend
        // acknowledges it. A Complete racing the stop loses.
        (StreamStatus::Stopping, SessionEvent::StopConfirmed | SessionEvent::Complete { .. })
        | (StreamStatus::Streaming | StreamStatus::Stopping, SessionEvent::Stopped) => {
            session.status = StreamStatus::Stopped;
            Ok(TransitionResult::ignored()
                .with_effect(Effect::PublishStopped {
                    partial: session.buffer(),
                })
                .with_effect(Effect::Reconcile))
        }

        // ============================================================
        // Failures
        // ============================================================
        (StreamStatus::Streaming | StreamStatus::Stopping, SessionEvent::Error { message }) => {
            session.status = StreamStatus::Errored {
                message: message.clone(),
            };
            Ok(TransitionResult::ignored().with_effect(Effect::errored(message)))
        }

        (StreamStatus::Streaming | StreamStatus::Stopping, SessionEvent::ConnectionLost) => {
            session.status = StreamStatus::Errored {
                message: CONNECTION_LOST_MESSAGE.to_string(),
            };
            Ok(TransitionResult::ignored().with_effect(Effect::errored(CONNECTION_LOST_MESSAGE)))
        }

        // ============================================================
        // Supersession
        // ============================================================
        (_, SessionEvent::Superseded) => {
            session.status = StreamStatus::Superseded;
            Ok(TransitionResult::ignored().with_effect(Effect::PublishSuperseded))
        }

        // ============================================================
        // Invalid Transitions
        // ============================================================
        (status, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {} with event {}",
            status.name(),
            event.name()
        ))),
    }
}
