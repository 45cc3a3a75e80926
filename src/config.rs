//! Client configuration from the environment

use crate::reconcile::ReconcileStrategy;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:3000/chat";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000/api";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPDATE_CAPACITY: usize = 256;

/// Endpoints, credentials and tuning for a `ChatClient`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub http_timeout: Duration,
    pub reconcile: ReconcileStrategy,
    /// Buffer size of the update broadcast channel
    pub update_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            reconcile: ReconcileStrategy::default(),
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values use defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            ws_url: lookup("AGRICHAT_WS_URL").unwrap_or(defaults.ws_url),
            api_url: lookup("AGRICHAT_API_URL").unwrap_or(defaults.api_url),
            auth_token: lookup("AGRICHAT_TOKEN").filter(|t| !t.is_empty()),
            connect_timeout: parsed(&lookup, "AGRICHAT_CONNECT_TIMEOUT_SECS")
                .map_or(defaults.connect_timeout, Duration::from_secs),
            http_timeout: parsed(&lookup, "AGRICHAT_HTTP_TIMEOUT_SECS").map_or(defaults.http_timeout, Duration::from_secs),
            reconcile: parsed(&lookup, "AGRICHAT_RECONCILE").unwrap_or(defaults.reconcile),
            update_capacity: parsed(&lookup, "AGRICHAT_UPDATE_CAPACITY")
                .filter(|c: &usize| *c > 0)
                .unwrap_or(defaults.update_capacity),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid setting");
            None
        }
    }
}
