//! Per-conversation session ownership and the generation-token check

use super::{transition, Effect, SessionEvent, SessionId, StreamSession};
use std::collections::HashMap;

/// Effects produced for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub conversation_id: String,
    pub session_id: SessionId,
    pub effects: Vec<Effect>,
}

/// Result of starting a new stream
#[derive(Debug)]
pub struct StartOutcome {
    pub session_id: SessionId,
    /// The live session this start replaced, if any
    pub superseded: Option<Applied>,
}

/// Holds the current session of every conversation.
///
/// A conversation has at most one session. Replacing it invalidates the old
/// generation token, so late events carrying that token never reach the new
/// session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, StreamSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new session for the conversation, superseding any live one.
    ///
    /// `link_epoch` is the link the start command is written to, `None` when
    /// it is queued for the next one.
    pub fn start(&mut self, conversation_id: &str, link_epoch: Option<u64>) -> StartOutcome {
        let superseded = self.sessions.remove(conversation_id).and_then(|mut old| {
            if old.status.is_terminal() {
                return None;
            }
            tracing::debug!(conv_id = %conversation_id, session_id = %old.id, "Superseding live session");
            let effects = transition(&mut old, SessionEvent::Superseded)
                .map(|r| r.effects)
                .unwrap_or_default();
            Some(Applied {
                conversation_id: conversation_id.to_string(),
                session_id: old.id,
                effects,
            })
        });

        let mut session = StreamSession::new(conversation_id);
        session.link_epoch = link_epoch;
        let started = transition(&mut session, SessionEvent::Start);
        debug_assert!(started.is_ok(), "Idle + Start must succeed");
        let session_id = session.id.clone();
        self.sessions.insert(conversation_id.to_string(), session);

        StartOutcome {
            session_id,
            superseded,
        }
    }

    /// Route an inbound event to the conversation's current session.
    ///
    /// Returns `None` when there is no session or the event carries a stale
    /// generation token; both are silent no-ops.
    pub fn apply(&mut self, conversation_id: &str, stream_id: Option<&str>, event: SessionEvent) -> Option<Applied> {
        let session = self.sessions.get_mut(conversation_id)?;

        if let Some(stream_id) = stream_id {
            if !session.id.matches_wire(stream_id) {
                tracing::trace!(
                    conv_id = %conversation_id,
                    stale = %stream_id,
                    current = %session.id,
                    "Stale event dropped"
                );
                return None;
            }
        }

        Self::run(session, event)
    }

    /// Issue a stop for the live session, if there is one
    pub fn request_stop(&mut self, conversation_id: &str) -> Option<Applied> {
        let session = self.sessions.get_mut(conversation_id)?;
        if !session.status.is_live() {
            return None;
        }
        Self::run(session, SessionEvent::StopRequested)
    }

    /// The backend acknowledged nothing yet, but `chat:stop` for this
    /// session is on the wire
    pub fn confirm_stop(&mut self, conversation_id: &str, session_id: &SessionId) -> Option<Applied> {
        let session = self.sessions.get_mut(conversation_id).filter(|s| &s.id == session_id)?;
        Self::run(session, SessionEvent::StopConfirmed)
    }

    /// Error every live session after the link went away
    pub fn connection_lost(&mut self) -> Vec<Applied> {
        self.sessions
            .values_mut()
            .filter(|s| s.status.is_live())
            .filter_map(|s| Self::run(s, SessionEvent::ConnectionLost))
            .collect()
    }

    /// Error the live sessions started on link `epoch` or an older one.
    /// Sessions still waiting for a link are kept.
    pub fn link_lost(&mut self, epoch: u64) -> Vec<Applied> {
        self.sessions
            .values_mut()
            .filter(|s| s.status.is_live() && s.link_epoch.is_some_and(|e| e <= epoch))
            .filter_map(|s| Self::run(s, SessionEvent::ConnectionLost))
            .collect()
    }

    /// Sessions whose start command was queued now belong to link `epoch`
    pub fn bind_link(&mut self, epoch: u64) {
        for session in self.sessions.values_mut().filter(|s| s.link_epoch.is_none()) {
            session.link_epoch = Some(epoch);
        }
    }

    /// Drop a non-terminal session without reconciling it
    pub fn abandon(&mut self, conversation_id: &str) -> Option<StreamSession> {
        if self.sessions.get(conversation_id)?.status.is_terminal() {
            return None;
        }
        self.sessions.remove(conversation_id)
    }

    /// Release a terminal session once it has been reconciled
    pub fn release(&mut self, conversation_id: &str, session_id: &SessionId) -> bool {
        match self.sessions.get(conversation_id) {
            Some(s) if &s.id == session_id && s.status.is_terminal() => {
                self.sessions.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&StreamSession> {
        self.sessions.get(conversation_id)
    }

    /// Token of the in-flight generation for the conversation
    pub fn live_session(&self, conversation_id: &str) -> Option<&SessionId> {
        self.sessions
            .get(conversation_id)
            .filter(|s| s.status.is_live())
            .map(|s| &s.id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn run(session: &mut StreamSession, event: SessionEvent) -> Option<Applied> {
        match transition(session, event) {
            Ok(result) if result.is_ignored() => None,
            Ok(result) => Some(Applied {
                conversation_id: session.conversation_id.clone(),
                session_id: session.id.clone(),
                effects: result.effects,
            }),
            Err(e) => {
                tracing::debug!(session_id = %session.id, error = %e, "Event rejected by session");
                None
            }
        }
    }
}
