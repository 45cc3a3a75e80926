//! Connection manager
//!
//! Owns the single link to the chat backend. Each live link runs a reader
//! task feeding the ordered inbound path and a writer task draining the
//! outbound gateway. Only this module writes `ConnectionState`.

pub mod transport;

pub use transport::{Connector, Link, LinkReader, LinkWriter, WsConnector};

use crate::error::{ChatError, ConnectError, TransportError};
use crate::gateway::OutboundFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Connection lifecycle as seen by the rest of the client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored { retriable: bool, reason: String },
}

impl ConnectionState {
    /// Whether commands that need a link may be queued
    pub fn accepts_streams(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Errored { .. } => "errored",
        }
    }
}

/// Events delivered to the ordered inbound path, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connection state changed
    State(ConnectionState),
    /// Raw inbound text frame
    Frame(String),
    /// The link with this epoch ended without `disconnect` being called
    Lost { epoch: u64, reason: String },
}

/// Writer side of a live link
#[derive(Debug, Clone)]
pub struct LinkHandle {
    /// Increases with every link the manager opens
    pub epoch: u64,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

struct ActiveLink {
    epoch: u64,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// State shared between the manager and its link tasks
struct LinkShared {
    state: watch::Sender<ConnectionState>,
    active: Mutex<Option<ActiveLink>>,
    next_epoch: AtomicU64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkShared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            tracing::info!(state = next.name(), "Connection state changed");
            // Receiver gone means the client is shutting down
            let _ = self.events.send(LinkEvent::State(next));
        }
    }

    /// Called by a reader task whose link ended on its own
    fn link_lost(&self, epoch: u64, reason: String) {
        {
            let mut active = self.active();
            match active.as_ref() {
                Some(link) if link.epoch == epoch => {
                    if let Some(link) = active.take() {
                        link.cancel.cancel();
                    }
                }
                // A newer link replaced this one, or disconnect already ran
                _ => return,
            }
        }

        tracing::warn!(epoch, reason = %reason, "Connection lost");
        self.set_state(ConnectionState::Errored {
            retriable: true,
            reason: reason.clone(),
        });
        let _ = self.events.send(LinkEvent::Lost { epoch, reason });
    }
}

/// Opens, tracks and tears down the backend link
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    shared: Arc<LinkShared>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            connect_timeout,
            shared: Arc::new(LinkShared {
                state,
                active: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
                events,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the link and start its tasks.
    ///
    /// Returns the handle feeding the writer task. Connecting while already
    /// connected returns the existing handle. Failures leave the state
    /// `Errored`; retrying is up to the caller.
    pub async fn connect(&self, auth_token: &str) -> Result<LinkHandle, ConnectError> {
        let _guard = self.connect_lock.lock().await;

        let existing = self.shared.active().as_ref().map(|link| LinkHandle {
            epoch: link.epoch,
            outbound: link.outbound.clone(),
        });
        if let Some(handle) = existing {
            return Ok(handle);
        }

        self.shared.set_state(ConnectionState::Connecting);

        let result = match tokio::time::timeout(self.connect_timeout, self.connector.connect(auth_token)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::timeout(format!(
                "Connect did not complete within {}s",
                self.connect_timeout.as_secs_f64()
            ))),
        };

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(kind = ?e.kind, retriable = e.is_retriable(), error = %e, "Connect failed");
                self.shared.set_state(ConnectionState::Errored {
                    retriable: e.is_retriable(),
                    reason: e.message.clone(),
                });
                return Err(e);
            }
        };

        if *self.shared.state.borrow() != ConnectionState::Connecting {
            // disconnect() ran while the handshake was in flight
            tracing::info!("Connect abandoned by disconnect");
            return Err(ConnectError::unreachable("Connect cancelled by disconnect"));
        }

        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // Register before spawning so an immediate hang-up finds its epoch
        *self.shared.active() = Some(ActiveLink {
            epoch,
            cancel: cancel.clone(),
            outbound: outbound_tx.clone(),
        });
        tracing::info!(epoch, "Connected");
        self.shared.set_state(ConnectionState::Connected);

        tokio::spawn(run_writer(link.writer, outbound_rx, cancel.clone()));
        tokio::spawn(run_reader(link.reader, Arc::clone(&self.shared), epoch, cancel));

        Ok(LinkHandle {
            epoch,
            outbound: outbound_tx,
        })
    }

    /// Tear down the link. Returns whether a link was open.
    ///
    /// Frames not yet written resolve with `ConnectionClosed`. No `Lost`
    /// event is emitted; the caller does its own cleanup.
    pub fn disconnect(&self) -> bool {
        let link = self.shared.active().take();
        let had_link = link.is_some();
        if let Some(link) = link {
            tracing::info!(epoch = link.epoch, "Disconnecting");
            link.cancel.cancel();
        }
        self.shared.set_state(ConnectionState::Disconnected);
        had_link
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Connection-state signal
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.active().is_some()
    }

    /// Epoch of the live link, if any
    pub fn active_epoch(&self) -> Option<u64> {
        self.shared.active().as_ref().map(|link| link.epoch)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(link) = self.shared.active().take() {
            link.cancel.cancel();
        }
    }
}

// ============================================================================
// Link tasks
// ============================================================================

async fn run_writer(
    mut writer: Box<dyn LinkWriter>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A write stuck on a dead peer must not outlive the link
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Closed),
            result = writer.send_frame(frame.text.clone()) => result,
        };

        match result {
            Ok(()) => {
                tracing::trace!(kind = frame.kind.wire_name(), conv_id = %frame.conversation_id, "Frame written");
                frame.resolve(Ok(()));
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    tracing::warn!(kind = frame.kind.wire_name(), error = %e, "Write failed");
                }
                frame.resolve(Err(ChatError::ConnectionClosed));
                break;
            }
        }
    }

    outbound.close();
    let mut rejected = 0usize;
    while let Ok(frame) = outbound.try_recv() {
        frame.resolve(Err(ChatError::ConnectionClosed));
        rejected += 1;
    }
    if rejected > 0 {
        tracing::debug!(rejected, "Rejected unwritten frames");
    }
    writer.close().await;
}

async fn run_reader(mut reader: Box<dyn LinkReader>, shared: Arc<LinkShared>, epoch: u64, cancel: CancellationToken) {
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = reader.next_frame() => match next {
                Some(Ok(text)) => {
                    if shared.events.send(LinkEvent::Frame(text)).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "Connection closed by server".to_string(),
            }
        }
    };
    shared.link_lost(epoch, reason);
}
