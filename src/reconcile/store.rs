//! Message store: the REST-backed source of truth for conversation history

use crate::protocol::inbound::string_or_number;
use crate::protocol::FollowUpQuestion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Who authored a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "bot", alias = "ai")]
    Assistant,
}

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub follow_up_questions: Vec<FollowUpQuestion>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Store failure with classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Network, message)
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Status(code), message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Decode, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Connect failure or timeout - retryable
    Network,
    /// Non-success HTTP status - retryable for 5xx and 429
    Status(u16),
    /// Body did not match the message schema - not retryable
    Decode,
}

impl StoreErrorKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network => true,
            Self::Status(code) => *code == 429 || (500..=599).contains(code),
            Self::Decode => false,
        }
    }
}

/// Read access to conversation history
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Get all messages for a conversation, oldest first
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        (**self).get_messages(conversation_id).await
    }
}

// ============================================================================
// REST store
// ============================================================================

/// Backends return either a bare array or a wrapped list
#[derive(Deserialize)]
#[serde(untagged)]
enum MessagesBody {
    List(Vec<Message>),
    Wrapped { messages: Vec<Message> },
}

/// `GET {api_url}/conversations/{id}/messages` with a bearer token
pub struct RestMessageStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl RestMessageStore {
    pub fn new(api_url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn messages_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/messages", self.base_url, conversation_id)
    }
}

#[async_trait]
impl MessageStore for RestMessageStore {
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut request = self.client.get(self.messages_url(conversation_id));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StoreError::network(format!("Request timeout: {e}"))
            } else if e.is_connect() {
                StoreError::network(format!("Connection failed: {e}"))
            } else {
                StoreError::network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(StoreError::status(status.as_u16(), format!("HTTP {status}: {body}")));
        }

        let parsed: MessagesBody =
            serde_json::from_str(&body).map_err(|e| StoreError::decode(format!("Failed to parse messages: {e}")))?;

        let mut messages = match parsed {
            MessagesBody::List(messages) | MessagesBody::Wrapped { messages } => messages,
        };
        for message in &mut messages {
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id.to_string();
            }
        }
        Ok(messages)
    }
}

// ============================================================================
// Hybrid store
// ============================================================================

/// Serves the last good copy of a conversation when the inner store fails
pub struct CachedMessageStore<S> {
    inner: S,
    cache: Mutex<HashMap<String, Vec<Message>>>,
}

impl<S: MessageStore> CachedMessageStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }
}

#[async_trait]
impl<S: MessageStore> MessageStore for CachedMessageStore<S> {
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        match self.inner.get_messages(conversation_id).await {
            Ok(messages) => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(conversation_id.to_string(), messages.clone());
                Ok(messages)
            }
            Err(e) => match self.cached(conversation_id) {
                Some(messages) => {
                    tracing::warn!(conv_id = %conversation_id, error = %e, "Store failed, serving cached messages");
                    Ok(messages)
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assistant_message, FakeBackend, MockMessageStore};

    #[test]
    fn test_message_decodes_backend_shapes() {
        let raw = r#"{"id":42,"role":"bot","content":"Plant after the first rains.","followUpQuestions":[{"id":1,"question":"Which variety?"}],"createdAt":"2024-03-01T08:00:00Z"}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.id, "42");
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.follow_up_questions[0].id, "1");
        assert!(message.created_at.is_some());
        assert_eq!(message.conversation_id, "");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::network("refused").is_retryable());
        assert!(StoreError::status(503, "busy").is_retryable());
        assert!(StoreError::status(429, "slow down").is_retryable());
        assert!(!StoreError::status(404, "gone").is_retryable());
        assert!(!StoreError::decode("bad json").is_retryable());
    }

    #[tokio::test]
    async fn test_cached_store_serves_last_good_copy() {
        let inner = Arc::new(MockMessageStore::new());
        inner.set_messages("c1", vec![assistant_message("c1", "m1", "Use compost.")]);
        let store = CachedMessageStore::new(Arc::clone(&inner));

        assert_eq!(store.get_messages("c1").await.unwrap().len(), 1);

        inner.fail_next(StoreError::network("offline"));
        let cached = store.get_messages("c1").await.unwrap();
        assert_eq!(cached[0].content, "Use compost.");

        inner.fail_next(StoreError::network("offline"));
        assert!(store.get_messages("c2").await.is_err());
    }

    #[tokio::test]
    async fn test_rest_store_sends_bearer_and_accepts_both_shapes() {
        let backend = FakeBackend::start("secret").await;
        backend.set_messages_body("c1", r#"[{"id":"m1","role":"user","content":"When to plant?"}]"#);
        backend.set_messages_body("c2", r#"{"messages":[{"id":"m2","role":"assistant","content":"In March."}]}"#);

        let store = RestMessageStore::new(&backend.api_url(), Some("secret".into()), Duration::from_secs(5)).unwrap();

        let messages = store.get_messages("c1").await.unwrap();
        assert_eq!(messages[0].conversation_id, "c1");
        assert_eq!(messages[0].role, MessageRole::User);

        let messages = store.get_messages("c2").await.unwrap();
        assert_eq!(messages[0].content, "In March.");
    }

    #[tokio::test]
    async fn test_rest_store_classifies_failures() {
        let backend = FakeBackend::start("secret").await;
        backend.set_messages_body("c1", "not json");

        let unauthorized = RestMessageStore::new(&backend.api_url(), None, Duration::from_secs(5)).unwrap();
        let err = unauthorized.get_messages("c1").await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Status(401));
        assert!(!err.is_retryable());

        let store = RestMessageStore::new(&backend.api_url(), Some("secret".into()), Duration::from_secs(5)).unwrap();
        let err = store.get_messages("c1").await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Decode);

        let err = store.get_messages("missing").await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Status(404));
    }
}
