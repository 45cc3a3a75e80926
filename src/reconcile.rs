//! Reconciliation layer
//!
//! A finished stream is provisional until the message store confirms it.
//! Each conversation keeps a local view: the stored messages plus, until the
//! next successful fetch, the reply text that arrived over the socket.

pub mod store;

pub use store::{CachedMessageStore, Message, MessageRole, MessageStore, RestMessageStore, StoreError, StoreErrorKind};

use crate::protocol::FollowUpQuestion;
use crate::state_machine::SessionId;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Where reconciliation reads canonical history from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileStrategy {
    /// REST store only
    #[default]
    Authoritative,
    /// REST store with a last-good-copy fallback
    Hybrid,
}

impl ReconcileStrategy {
    /// Wrap the REST store according to the strategy
    pub fn build_store<S: MessageStore + 'static>(self, rest: S) -> Arc<dyn MessageStore> {
        match self {
            ReconcileStrategy::Authoritative => Arc::new(rest),
            ReconcileStrategy::Hybrid => Arc::new(CachedMessageStore::new(rest)),
        }
    }
}

impl FromStr for ReconcileStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "authoritative" => Ok(Self::Authoritative),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown reconcile strategy: {other}")),
        }
    }
}

/// Reconciliation failed; the provisional reply stays visible
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to reconcile conversation {conversation_id}: {source}")]
pub struct ReconcileError {
    pub conversation_id: String,
    pub source: StoreError,
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Streamed reply not yet confirmed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalReply {
    pub session_id: SessionId,
    pub content: String,
}

/// Local state of one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    /// Last fetched canonical history
    pub messages: Vec<Message>,
    pub provisional: Option<ProvisionalReply>,
    pub follow_up_questions: Vec<FollowUpQuestion>,
    pub title: Option<String>,
    /// Reconciliation failure awaiting dismissal or retry
    pub last_error: Option<StoreError>,
    /// Ticket of the latest fetch; older results are discarded
    fetch_ticket: u64,
}

impl ConversationView {
    /// Latest assistant reply: the provisional one if present, else the stored one
    pub fn latest_reply(&self) -> Option<&str> {
        if let Some(provisional) = &self.provisional {
            return Some(&provisional.content);
        }
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn dismiss_error(&mut self) {
        self.last_error = None;
    }
}

/// Merges finished streams with the message store
pub struct Reconciler {
    store: Arc<dyn MessageStore>,
    views: Mutex<HashMap<String, ConversationView>>,
    next_ticket: AtomicU64,
}

impl Reconciler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            views: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn views(&self) -> MutexGuard<'_, HashMap<String, ConversationView>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep a completed reply visible until the store confirms it
    pub fn record_completion(
        &self,
        conversation_id: &str,
        session_id: &SessionId,
        content: &str,
        follow_up_questions: &[FollowUpQuestion],
        title: Option<&str>,
    ) {
        let mut views = self.views();
        let view = views.entry(conversation_id.to_string()).or_default();
        view.provisional = Some(ProvisionalReply {
            session_id: session_id.clone(),
            content: content.to_string(),
        });
        view.follow_up_questions = follow_up_questions.to_vec();
        if let Some(title) = title {
            view.title = Some(title.to_string());
        }
    }

    /// Keep the partial text of a stopped reply visible
    pub fn record_stopped(&self, conversation_id: &str, session_id: &SessionId, partial: &str) {
        let mut views = self.views();
        let view = views.entry(conversation_id.to_string()).or_default();
        view.provisional = (!partial.is_empty()).then(|| ProvisionalReply {
            session_id: session_id.clone(),
            content: partial.to_string(),
        });
        view.follow_up_questions.clear();
    }

    /// Fetch canonical history and replace the provisional reply with it.
    ///
    /// On failure the provisional reply is kept and the error is recorded on
    /// the view. Returns the number of stored messages.
    pub async fn reconcile(&self, conversation_id: &str) -> Result<usize, ReconcileError> {
        let (ticket, pending) = {
            let mut views = self.views();
            let view = views.entry(conversation_id.to_string()).or_default();
            view.fetch_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            (
                view.fetch_ticket,
                view.provisional.as_ref().map(|p| p.session_id.clone()),
            )
        };

        tracing::debug!(conv_id = %conversation_id, ticket, "Reconciling conversation");
        let result = self.store.get_messages(conversation_id).await;

        let mut views = self.views();
        let Some(view) = views.get_mut(conversation_id).filter(|view| view.fetch_ticket == ticket) else {
            // A newer fetch started, or the conversation was forgotten
            tracing::debug!(conv_id = %conversation_id, ticket, "Superseded fetch result discarded");
            return result.map(|m| m.len()).map_err(|source| ReconcileError {
                conversation_id: conversation_id.to_string(),
                source,
            });
        };

        match result {
            Ok(messages) => {
                let count = messages.len();
                view.messages = messages;
                // A reply recorded while the fetch was in flight stays provisional
                if view.provisional.as_ref().map(|p| &p.session_id) == pending.as_ref() {
                    view.provisional = None;
                }
                view.last_error = None;
                tracing::info!(conv_id = %conversation_id, messages = count, "Conversation reconciled");
                Ok(count)
            }
            Err(source) => {
                tracing::warn!(
                    conv_id = %conversation_id,
                    error = %source,
                    retryable = source.is_retryable(),
                    "Reconciliation failed"
                );
                view.last_error = Some(source.clone());
                Err(ReconcileError {
                    conversation_id: conversation_id.to_string(),
                    source,
                })
            }
        }
    }

    pub fn view(&self, conversation_id: &str) -> Option<ConversationView> {
        self.views().get(conversation_id).cloned()
    }

    /// Clear a surfaced reconciliation error. Returns whether one was set.
    pub fn dismiss_error(&self, conversation_id: &str) -> bool {
        self.views()
            .get_mut(conversation_id)
            .and_then(|view| view.last_error.take())
            .is_some()
    }

    /// Drop the conversation's local state. Returns whether there was any.
    pub fn forget(&self, conversation_id: &str) -> bool {
        self.views().remove(conversation_id).is_some()
    }

    /// Whether the conversation has an error a retry could clear
    pub fn has_error(&self, conversation_id: &str) -> bool {
        self.views()
            .get(conversation_id)
            .is_some_and(|view| view.last_error.is_some())
    }
}
