//! agrichat - streaming chat transport for a farming-advice assistant
//!
//! A client that keeps one WebSocket to the generation backend, streams
//! replies chunk by chunk into per-conversation sessions, and reconciles
//! finished replies with the REST message store.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod state_machine;

#[cfg(test)]
mod testing;

pub use client::{ChatClient, ClientUpdate, SentMessage};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, Connector, WsConnector};
pub use error::{ChatError, ConnectError, ConnectErrorKind, TransportError};
pub use gateway::Delivery;
pub use protocol::{ChatEvent, FollowUpQuestion, PendingCommand};
pub use reconcile::{ConversationView, Message, MessageStore, ReconcileError, ReconcileStrategy, StoreError};
pub use state_machine::{SessionId, StreamSession, StreamStatus};
