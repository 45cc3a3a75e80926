//! Trait abstractions for the socket
//!
//! These traits let the connection manager run against a scripted link in
//! tests and a WebSocket in production.

use crate::error::{ConnectError, TransportError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Receiving half of an open link
#[async_trait]
pub trait LinkReader: Send {
    /// Next text frame; `None` once the peer closed the link
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// Sending half of an open link
#[async_trait]
pub trait LinkWriter: Send {
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError>;

    /// Best-effort close handshake
    async fn close(&mut self);
}

/// Both halves of a freshly opened link
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

/// Opens links to the chat backend
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link, presenting the bearer token during the handshake
    async fn connect(&self, auth_token: &str) -> Result<Link, ConnectError>;
}

// ============================================================================
// WebSocket implementation
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector over `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, auth_token: &str) -> Result<Link, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::invalid_url(format!("{}: {e}", self.url)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|_| ConnectError::unauthorized("Auth token contains invalid header characters"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_handshake_error)?;

        let (sink, stream) = stream.split();
        Ok(Link {
            reader: Box::new(WsReader { stream }),
            writer: Box::new(WsWriter { sink }),
        })
    }
}

/// Map a handshake failure onto the retry classification
fn classify_handshake_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ConnectError::unauthorized(format!("Handshake rejected: {status}"))
            } else if status.is_server_error() {
                ConnectError::server_error(format!("Handshake failed: {status}"))
            } else {
                ConnectError::rejected(format!("Handshake rejected: {status}"))
            }
        }
        tungstenite::Error::Url(e) => ConnectError::invalid_url(e.to_string()),
        tungstenite::Error::Io(e) => ConnectError::unreachable(e.to_string()),
        other => ConnectError::unreachable(other.to_string()),
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl LinkReader for WsReader {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // Ping/pong are answered by tungstenite
                Ok(_) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl LinkWriter for WsWriter {
    async fn send_frame(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink.send(Message::Text(frame.into())).await.map_err(|e| match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => TransportError::Closed,
            other => TransportError::Io(other.to_string()),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectErrorKind;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn test_bearer_token_is_accepted_and_frames_flow() {
        let backend = FakeBackend::start("good-token").await;
        let connector = WsConnector::new(backend.ws_url());

        let mut link = connector.connect("good-token").await.unwrap();
        link.writer
            .send_frame(r#"{"event":"chat:join","data":{"conversationId":"c1"}}"#.to_string())
            .await
            .unwrap();

        // The fake backend echoes every frame back
        let echoed = link.reader.next_frame().await.unwrap().unwrap();
        assert!(echoed.contains("chat:join"));
        link.writer.close().await;
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized_and_not_retriable() {
        let backend = FakeBackend::start("good-token").await;
        let connector = WsConnector::new(backend.ws_url());

        let err = connector.connect("stolen-token").await.err().unwrap();
        assert_eq!(err.kind, ConnectErrorKind::Unauthorized);
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retriable() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(format!("ws://{addr}/chat"));
        let err = connector.connect("any").await.err().unwrap();
        assert_eq!(err.kind, ConnectErrorKind::Unreachable);
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retriable() {
        let connector = WsConnector::new("not a url");
        let err = connector.connect("any").await.err().unwrap();
        assert_eq!(err.kind, ConnectErrorKind::InvalidUrl);
    }
}
