//! Mock implementations for testing
//!
//! These mocks let the client run against a scripted backend without real
//! I/O. `FakeBackend` is a real axum server for the production connector and
//! REST store.

use crate::connection::{Connector, Link, LinkReader, LinkWriter};
use crate::error::{ConnectError, TransportError};
use crate::reconcile::{Message, MessageRole, MessageStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const WAIT: Duration = Duration::from_secs(2);

/// Receive from a channel or fail the test after a bounded wait
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

// ============================================================================
// Mock connector
// ============================================================================

#[derive(Default)]
struct ConnectorState {
    tokens: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ConnectError>>,
    hang_next: AtomicBool,
    pauses: Mutex<VecDeque<oneshot::Receiver<()>>>,
    stall_writes: AtomicBool,
    servers: Mutex<VecDeque<MockServer>>,
    server_ready: tokio::sync::Notify,
}

/// Connector whose links are driven by `MockServer`s
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next connect attempt with `error`
    pub fn fail_next(&self, error: ConnectError) {
        self.state.failures.lock().unwrap().push_back(error);
    }

    /// Make the next connect attempt never finish
    pub fn hang_next(&self) {
        self.state.hang_next.store(true, Ordering::SeqCst);
    }

    /// Hold the next connect attempt until the returned sender fires
    pub fn pause_next(&self) -> oneshot::Sender<()> {
        let (resume, paused) = oneshot::channel();
        self.state.pauses.lock().unwrap().push_back(paused);
        resume
    }

    /// Writes on later links never complete
    pub fn stall_writes(&self) {
        self.state.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Tokens presented so far
    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    /// Server side of the oldest link not yet taken
    pub async fn server(&self) -> MockServer {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.state.server_ready.notified();
                if let Some(server) = self.state.servers.lock().unwrap().pop_front() {
                    return server;
                }
                notified.await;
            }
        })
        .await
        .expect("no link was opened")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, auth_token: &str) -> Result<Link, ConnectError> {
        self.state.tokens.lock().unwrap().push(auth_token.to_string());

        if self.state.hang_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pause = self.state.pauses.lock().unwrap().pop_front();
        if let Some(paused) = pause {
            let _ = paused.await;
        }
        if let Some(error) = self.state.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.state.servers.lock().unwrap().push_back(MockServer {
            frames: frames_tx,
            commands: commands_rx,
        });
        self.state.server_ready.notify_waiters();

        Ok(Link {
            reader: Box::new(MockReader { frames: frames_rx }),
            writer: Box::new(MockWriter {
                commands: commands_tx,
                stall: self.state.stall_writes.load(Ordering::SeqCst),
            }),
        })
    }
}

struct MockReader {
    frames: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl LinkReader for MockReader {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.frames.recv().await.map(Ok)
    }
}

struct MockWriter {
    commands: mpsc::UnboundedSender<String>,
    stall: bool,
}

#[async_trait]
impl LinkWriter for MockWriter {
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.commands.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {}
}

/// Backend end of a mock link
pub struct MockServer {
    frames: mpsc::UnboundedSender<String>,
    commands: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    /// Deliver a raw frame to the client
    pub fn push(&self, frame: &str) {
        let _ = self.frames.send(frame.to_string());
    }

    /// Deliver `{"event": event, "data": data}`
    pub fn emit(&self, event: &str, data: serde_json::Value) {
        self.push(&serde_json::json!({ "event": event, "data": data }).to_string());
    }

    /// Next frame the client wrote
    pub async fn next_command(&mut self) -> String {
        recv_within(&mut self.commands).await
    }

    /// Next command of the given type, as parsed JSON; others are skipped
    pub async fn expect_command(&mut self, event: &str) -> serde_json::Value {
        loop {
            let frame: serde_json::Value = serde_json::from_str(&self.next_command().await).unwrap();
            if frame["event"] == event {
                return frame["data"].clone();
            }
        }
    }

    /// Command types written so far and not yet read
    pub fn drain_commands(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        while let Ok(frame) = self.commands.try_recv() {
            let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
            events.push(frame["event"].as_str().unwrap_or_default().to_string());
        }
        events
    }

    /// Close the link from the backend side
    pub fn hang_up(self) {}
}

// ============================================================================
// Mock message store
// ============================================================================

/// In-memory store that records every fetch
#[derive(Default)]
pub struct MockMessageStore {
    messages: Mutex<HashMap<String, Vec<Message>>>,
    failures: Mutex<VecDeque<StoreError>>,
    fetches: Mutex<Vec<String>>,
}

impl MockMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.messages.lock().unwrap().insert(conversation_id.to_string(), messages);
    }

    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn fetch_count(&self, conversation_id: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|c| *c == conversation_id).count()
    }
}

#[async_trait]
impl MessageStore for MockMessageStore {
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.fetches.lock().unwrap().push(conversation_id.to_string());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn assistant_message(conversation_id: &str, id: &str, content: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        role: MessageRole::Assistant,
        content: content.to_string(),
        follow_up_questions: Vec::new(),
        created_at: None,
    }
}

// ============================================================================
// Fake backend
// ============================================================================

#[derive(Clone)]
struct BackendState {
    token: String,
    bodies: Arc<Mutex<HashMap<String, String>>>,
}

impl BackendState {
    fn authorized(&self, headers: &axum::http::HeaderMap) -> bool {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", self.token))
    }
}

/// Real HTTP server: an echoing WebSocket at `/chat` and message history
/// at `/api/conversations/:id/messages`, both behind a bearer token
pub struct FakeBackend {
    addr: SocketAddr,
    bodies: Arc<Mutex<HashMap<String, String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start(token: &str) -> Self {
        use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
        use axum::extract::{Path, State};
        use axum::http::{header, HeaderMap, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::get;

        async fn echo(mut socket: WebSocket) {
            while let Some(Ok(message)) = socket.recv().await {
                match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }

        async fn chat(State(state): State<BackendState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
            if !state.authorized(&headers) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            ws.on_upgrade(echo)
        }

        async fn messages(
            State(state): State<BackendState>,
            Path(id): Path<String>,
            headers: HeaderMap,
        ) -> Response {
            if !state.authorized(&headers) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            let body = state.bodies.lock().unwrap().get(&id).cloned();
            match body {
                Some(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }

        let bodies = Arc::new(Mutex::new(HashMap::new()));
        let state = BackendState {
            token: token.to_string(),
            bodies: Arc::clone(&bodies),
        };
        let app = axum::Router::new()
            .route("/chat", get(chat))
            .route("/api/conversations/:id/messages", get(messages))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, bodies, task }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/chat", self.addr)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Raw JSON body served for a conversation's message history
    pub fn set_messages_body(&self, conversation_id: &str, body: &str) {
        self.bodies
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), body.to_string());
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}
