//! Chat client facade
//!
//! Wires the connection, dispatcher, presence, sessions, gateway and
//! reconciler together. Inbound frames are handled by a single dispatch task
//! in arrival order. Commands go straight to the gateway and never wait on
//! that task.


use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Connector, LinkEvent, WsConnector};
use crate::dispatcher::Dispatcher;
use crate::error::ChatError;
use crate::gateway::{CommandGateway, Delivery};
use crate::presence::PresenceManager;
use crate::protocol::{ChatEvent, FollowUpQuestion, PendingCommand};
use crate::reconcile::{ConversationView, MessageStore, ReconcileError, Reconciler, RestMessageStore, StoreError};
use crate::state_machine::{Applied, Effect, SessionEvent, SessionId, SessionRegistry, StreamSession};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;

/// Updates published to UI subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    ConnectionChanged(ConnectionState),
    Partial {
        conversation_id: String,
        session_id: SessionId,
        content: String,
    },
    Completed {
        conversation_id: String,
        session_id: SessionId,
        content: String,
        follow_up_questions: Vec<FollowUpQuestion>,
        title: Option<String>,
    },
    Stopped {
        conversation_id: String,
        session_id: SessionId,
        partial: String,
    },
    Errored {
        conversation_id: String,
        session_id: SessionId,
        message: String,
    },
    Superseded {
        conversation_id: String,
        session_id: SessionId,
    },
    Typing {
        conversation_id: String,
        is_typing: bool,
    },
    Reconciled {
        conversation_id: String,
        message_count: usize,
    },
    ReconcileFailed {
        conversation_id: String,
        error: ReconcileError,
    },
    /// A frame the dispatcher did not recognise
    ProtocolWarning {
        conversation_id: String,
        frame_type: String,
    },
}

/// Result of `send_message`
#[derive(Debug)]
pub struct SentMessage {
    /// Generation token of the new stream
    pub session_id: SessionId,
    /// Resolves once `chat:stream` is on the wire
    pub delivery: Delivery,
}

/// State guarded by one lock; never held across an await
#[derive(Default)]
struct Core {
    presence: PresenceManager,
    sessions: SessionRegistry,
    gateway: CommandGateway,
    dispatcher: Dispatcher,
}

struct Inner {
    connection: ConnectionManager,
    reconciler: Reconciler,
    core: Mutex<Core>,
    updates: broadcast::Sender<ClientUpdate>,
}

/// Streaming chat client; cheap to clone
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    /// Build a client that talks WebSocket + REST as configured.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: &ClientConfig) -> Result<Self, StoreError> {
        let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
        let rest = RestMessageStore::new(&config.api_url, config.auth_token.clone(), config.http_timeout)?;
        let store = config.reconcile.build_store(rest);
        Ok(Self::with_parts(connector, store, config))
    }

    /// Build a client from explicit transport and store implementations.
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_parts(connector: Arc<dyn Connector>, store: Arc<dyn MessageStore>, config: &ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));

        let inner = Arc::new(Inner {
            connection: ConnectionManager::new(connector, config.connect_timeout, events_tx),
            reconciler: Reconciler::new(store),
            core: Mutex::new(Core::default()),
            updates,
        });

        tokio::spawn(run_dispatch(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Open the link and flush commands queued while connecting.
    ///
    /// Failure is reported here and through the connection state; the
    /// client does not retry on its own.
    pub async fn connect(&self, auth_token: &str) -> Result<(), ChatError> {
        match self.inner.connection.connect(auth_token).await {
            Ok(link) => {
                let epoch = link.epoch;
                let mut core = self.inner.core();
                core.gateway.attach(link);
                // The link may already be gone; its loss handling covers that
                if core.gateway.writing_epoch() == Some(epoch) {
                    core.sessions.bind_link(epoch);
                    core.presence.bind_link(epoch);
                }
                Ok(())
            }
            Err(e) => {
                let mut core = self.inner.core();
                self.inner.teardown(&mut core);
                Err(e.into())
            }
        }
    }

    /// Close the link, release every room, error live sessions and reject
    /// commands that were not written yet
    pub fn disconnect(&self) {
        let mut core = self.inner.core();
        self.inner.connection.disconnect();
        self.inner.teardown(&mut core);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.inner.updates.subscribe()
    }

    /// Updates as a `Stream`; lagged receivers yield an error item
    pub fn update_stream(&self) -> BroadcastStream<ClientUpdate> {
        BroadcastStream::new(self.subscribe())
    }

    // ========================================================================
    // Rooms
    // ========================================================================

    /// Reference a conversation room. Returns the delivery of `chat:join`
    /// when this was the first reference.
    pub fn join(&self, conversation_id: &str) -> Option<Delivery> {
        let mut core = self.inner.core();
        let link_epoch = core.gateway.writing_epoch();
        let join = core.presence.join(conversation_id, link_epoch)?;
        Some(core.gateway.submit(&join))
    }

    /// Drop a room reference. The last one sends `chat:leave`, abandons
    /// any unfinished stream and drops the local conversation view.
    pub fn leave(&self, conversation_id: &str) -> Option<Delivery> {
        let mut core = self.inner.core();
        let leave = core.presence.leave(conversation_id)?;
        if let Some(abandoned) = core.sessions.abandon(conversation_id) {
            tracing::info!(conv_id = %conversation_id, session_id = %abandoned.id, "Unfinished stream abandoned");
        }
        core.dispatcher.forget(conversation_id);
        self.inner.reconciler.forget(conversation_id);
        Some(core.gateway.submit(&leave))
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.inner.core().presence.joined_rooms()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Start generating a reply to `text`.
    ///
    /// Joins the room first if needed and supersedes any stream still
    /// running for the conversation.
    pub fn send_message(&self, conversation_id: &str, text: &str) -> Result<SentMessage, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let mut core = self.inner.core();
        // Checked under the lock so a concurrent teardown cannot miss the session
        if !self.inner.connection.state().accepts_streams() {
            return Err(ChatError::NotConnected);
        }

        let link_epoch = core.gateway.writing_epoch();
        if let Some(join) = core.presence.ensure_joined(conversation_id, link_epoch) {
            let _ = core.gateway.submit(&join);
        }

        let outcome = core.sessions.start(conversation_id, link_epoch);
        if let Some(superseded) = outcome.superseded {
            self.inner.execute(&mut core, superseded);
        }
        core.dispatcher.note_stream_started(conversation_id);

        let command = PendingCommand::start_stream(conversation_id, text, outcome.session_id.clone());
        let delivery = core.gateway.submit(&command);
        tracing::info!(conv_id = %conversation_id, session_id = %outcome.session_id, "Stream started");

        Ok(SentMessage {
            session_id: outcome.session_id,
            delivery,
        })
    }

    /// Stop the conversation's running stream. Returns false, sending
    /// nothing, when no stream is running.
    pub fn stop(&self, conversation_id: &str) -> bool {
        let mut core = self.inner.core();
        match core.sessions.request_stop(conversation_id) {
            Some(applied) => {
                self.inner.execute(&mut core, applied);
                true
            }
            None => {
                tracing::debug!(conv_id = %conversation_id, "No running stream to stop");
                false
            }
        }
    }

    /// Fire-and-forget typing indicator
    pub fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        let mut core = self.inner.core();
        let _ = core.gateway.submit(&PendingCommand::typing(conversation_id, is_typing));
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Fetch the conversation from the store again, e.g. after a failure
    pub async fn retry_reconcile(&self, conversation_id: &str) -> Result<usize, ReconcileError> {
        let result = self.inner.reconciler.reconcile(conversation_id).await;
        self.inner.publish_reconciled(conversation_id, &result);
        result
    }

    /// Clear a surfaced reconciliation error
    pub fn dismiss_error(&self, conversation_id: &str) -> bool {
        self.inner.reconciler.dismiss_error(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationView> {
        self.inner.reconciler.view(conversation_id)
    }

    /// Snapshot of the conversation's current stream session
    pub fn session(&self, conversation_id: &str) -> Option<StreamSession> {
        self.inner.core().sessions.get(conversation_id).cloned()
    }
}

// ============================================================================
// Inbound path and effect execution
// ============================================================================

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: ClientUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::State(state) => self.publish(ClientUpdate::ConnectionChanged(state)),
            LinkEvent::Frame(raw) => self.handle_frame(&raw),
            LinkEvent::Lost { epoch, reason } => {
                let mut core = self.core();
                match self.connection.active_epoch() {
                    // Reconnected before this loss was processed
                    Some(active) if active > epoch => self.release_link(&mut core, epoch, &reason),
                    _ => self.teardown(&mut core),
                }
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, raw: &str) {
        let mut guard = self.core();
        let core = &mut *guard;

        let Some(dispatched) = core.dispatcher.dispatch(raw, &core.presence) else {
            return;
        };
        let conversation_id = dispatched.conversation_id;

        match dispatched.event {
            ChatEvent::Typing { is_typing } => self.publish(ClientUpdate::Typing {
                conversation_id,
                is_typing,
            }),
            ChatEvent::Error {
                diagnostic: Some(diagnostic),
                ..
            } => self.publish(ClientUpdate::ProtocolWarning {
                conversation_id,
                frame_type: diagnostic.frame_type,
            }),
            event => {
                let Some(event) = SessionEvent::from_chat_event(event) else {
                    return;
                };
                if let Some(applied) = core.sessions.apply(&conversation_id, dispatched.stream_id.as_deref(), event) {
                    self.execute(core, applied);
                }
            }
        }
    }

    /// Run the effects of one session transition
    fn execute(self: &Arc<Self>, core: &mut Core, applied: Applied) {
        let Applied {
            conversation_id,
            session_id,
            effects,
        } = applied;

        for effect in effects {
            match effect {
                Effect::PublishPartial { content } => self.publish(ClientUpdate::Partial {
                    conversation_id: conversation_id.clone(),
                    session_id: session_id.clone(),
                    content,
                }),
                Effect::PublishCompleted {
                    content,
                    follow_up_questions,
                    title,
                } => {
                    self.reconciler.record_completion(
                        &conversation_id,
                        &session_id,
                        &content,
                        &follow_up_questions,
                        title.as_deref(),
                    );
                    tracing::info!(conv_id = %conversation_id, session_id = %session_id, "Stream completed");
                    self.publish(ClientUpdate::Completed {
                        conversation_id: conversation_id.clone(),
                        session_id: session_id.clone(),
                        content,
                        follow_up_questions,
                        title,
                    });
                }
                Effect::PublishStopped { partial } => {
                    self.reconciler.record_stopped(&conversation_id, &session_id, &partial);
                    tracing::info!(conv_id = %conversation_id, session_id = %session_id, "Stream stopped");
                    self.publish(ClientUpdate::Stopped {
                        conversation_id: conversation_id.clone(),
                        session_id: session_id.clone(),
                        partial,
                    });
                }
                Effect::PublishErrored { message } => {
                    tracing::warn!(conv_id = %conversation_id, session_id = %session_id, error = %message, "Stream failed");
                    // Nothing to reconcile, the update is all that remains
                    core.sessions.release(&conversation_id, &session_id);
                    self.publish(ClientUpdate::Errored {
                        conversation_id: conversation_id.clone(),
                        session_id: session_id.clone(),
                        message,
                    });
                }
                Effect::PublishSuperseded => self.publish(ClientUpdate::Superseded {
                    conversation_id: conversation_id.clone(),
                    session_id: session_id.clone(),
                }),
                Effect::SendStop => {
                    let delivery = core.gateway.submit(&PendingCommand::stop(conversation_id.clone()));
                    self.spawn_stop_confirmation(conversation_id.clone(), session_id.clone(), delivery);
                }
                Effect::Reconcile => self.spawn_reconcile(conversation_id.clone(), session_id.clone()),
            }
        }
    }

    fn spawn_reconcile(self: &Arc<Self>, conversation_id: String, session_id: SessionId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.reconciler.reconcile(&conversation_id).await;
            inner.core().sessions.release(&conversation_id, &session_id);
            inner.publish_reconciled(&conversation_id, &result);
        });
    }

    /// End a stop once `chat:stop` is written; the backend may never answer
    fn spawn_stop_confirmation(self: &Arc<Self>, conversation_id: String, session_id: SessionId, delivery: Delivery) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = delivery.confirmed().await {
                // Loss handling errors the session
                tracing::debug!(conv_id = %conversation_id, error = %e, "Stop was not written");
                return;
            }
            let mut core = inner.core();
            if let Some(applied) = core.sessions.confirm_stop(&conversation_id, &session_id) {
                inner.execute(&mut core, applied);
            }
        });
    }

    fn publish_reconciled(&self, conversation_id: &str, result: &Result<usize, ReconcileError>) {
        self.publish(match result {
            Ok(message_count) => ClientUpdate::Reconciled {
                conversation_id: conversation_id.to_string(),
                message_count: *message_count,
            },
            Err(error) => ClientUpdate::ReconcileFailed {
                conversation_id: conversation_id.to_string(),
                error: error.clone(),
            },
        });
    }

    /// A link that was already replaced went away. Only the sessions and
    /// rooms bound to it are released; the gateway stays with the new link.
    fn release_link(self: &Arc<Self>, core: &mut Core, epoch: u64, reason: &str) {
        if core.gateway.epoch().is_some_and(|attached| attached <= epoch) {
            // New link not attached yet, queue until it is
            core.gateway.detach();
        }
        let released = core.presence.release_link(epoch);

        let lost = core.sessions.link_lost(epoch);
        let errored = lost.len();
        for applied in lost {
            self.execute(core, applied);
        }

        tracing::info!(
            epoch,
            reason = %reason,
            rooms = released.len(),
            sessions = errored,
            "Replaced link released"
        );
    }

    /// Forget everything tied to the link that just went away
    fn teardown(self: &Arc<Self>, core: &mut Core) {
        core.gateway.detach();
        let rejected = core.gateway.reject_pending();
        let released = core.presence.release_all();
        core.dispatcher = Dispatcher::new();

        let lost = core.sessions.connection_lost();
        let errored = lost.len();
        for applied in lost {
            self.execute(core, applied);
        }

        tracing::info!(
            rejected,
            rooms = released.len(),
            sessions = errored,
            "Link state released"
        );
    }
}

/// The ordered inbound path: one task per client
async fn run_dispatch(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    tracing::info!("Dispatch task started");
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_link_event(event);
    }
    tracing::info!("Dispatch task stopped");
}
