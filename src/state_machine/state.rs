//! Stream session state types

use crate::protocol::FollowUpQuestion;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Generation token
// ============================================================================

/// Opaque generation token minted for every start-stream call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Compare against a `streamId` echoed by the backend
    pub fn matches_wire(&self, stream_id: &str) -> bool {
        Uuid::parse_str(stream_id).is_ok_and(|id| id == self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Session status
// ============================================================================

/// Lifecycle of a single generation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamStatus {
    /// Created, start command not yet accepted
    #[default]
    Idle,

    /// Chunks are arriving
    Streaming,

    /// User asked to stop, `chat:stop` not yet on the wire
    Stopping,

    /// Backend delivered the final content
    Completed,

    /// Generation ended by a stop
    Stopped,

    /// Backend reported an error, or the connection dropped mid-stream
    Errored { message: String },

    /// A newer stream for the same conversation replaced this one
    Superseded,
}

impl StreamStatus {
    /// Terminal statuses absorb every later event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamStatus::Completed
                | StreamStatus::Stopped
                | StreamStatus::Errored { .. }
                | StreamStatus::Superseded
        )
    }

    /// Whether a generation is in flight
    pub fn is_live(&self) -> bool {
        matches!(self, StreamStatus::Streaming | StreamStatus::Stopping)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Stopping => "stopping",
            StreamStatus::Completed => "completed",
            StreamStatus::Stopped => "stopped",
            StreamStatus::Errored { .. } => "errored",
            StreamStatus::Superseded => "superseded",
        }
    }
}

// ============================================================================
// Stream session
// ============================================================================

/// How a chunk was absorbed into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Next chunk in sequence
    InOrder,
    /// Seq skipped ahead of the highest chunk seen
    Gap,
    /// Filled a hole left by an earlier gap
    Backfill,
    /// Seq already received
    Duplicate,
}

/// One generation for one conversation
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub id: SessionId,
    pub conversation_id: String,
    pub status: StreamStatus,
    /// Fragments keyed by declared seq, never by arrival order
    fragments: BTreeMap<u64, String>,
    /// Set once any seq skipped ahead
    pub gap_detected: bool,
    /// Authoritative text from the `Complete` event
    pub final_content: Option<String>,
    pub follow_up_questions: Vec<FollowUpQuestion>,
    pub updated_title: Option<String>,
    /// Link its start command was written to; `None` while still queued
    pub link_epoch: Option<u64>,
}

impl StreamSession {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            conversation_id: conversation_id.into(),
            status: StreamStatus::Idle,
            fragments: BTreeMap::new(),
            gap_detected: false,
            final_content: None,
            follow_up_questions: Vec::new(),
            updated_title: None,
            link_epoch: None,
        }
    }

    /// Highest chunk seq received, 0 before the first chunk
    pub fn last_chunk_seq(&self) -> u64 {
        self.fragments.keys().next_back().copied().unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.fragments.len()
    }

    /// Incremental text for display: received fragments in seq order
    pub fn buffer(&self) -> String {
        self.fragments.values().map(String::as_str).collect()
    }

    /// Text to show for this session: final content once known, else the buffer
    pub fn visible_content(&self) -> String {
        self.final_content.clone().unwrap_or_else(|| self.buffer())
    }

    pub(crate) fn accept_chunk(&mut self, seq: u64, content: String) -> ChunkOutcome {
        if self.fragments.contains_key(&seq) {
            return ChunkOutcome::Duplicate;
        }

        let outcome = match self.fragments.keys().next_back().copied() {
            // Backends number from either 0 or 1
            None if seq <= 1 => ChunkOutcome::InOrder,
            None => ChunkOutcome::Gap,
            Some(last) if seq == last.saturating_add(1) => ChunkOutcome::InOrder,
            Some(last) if seq > last => ChunkOutcome::Gap,
            Some(_) => ChunkOutcome::Backfill,
        };

        if outcome == ChunkOutcome::Gap {
            self.gap_detected = true;
        }
        self.fragments.insert(seq, content);
        outcome
    }
}
