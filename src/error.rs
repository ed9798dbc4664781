//! Error taxonomy for the memory engine.
//!
//! [`EngineError`] is what callers of the core surface see. Transient failures of
//! external capabilities ([`CapabilityError`]) are retried before they are
//! converted; storage failures arrive as [`PersistenceError`].

use thiserror::Error;

use crate::graph::types::NoteId;

/// Result type alias using the engine's error type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by ingestion, traversal and consolidation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The Extractor failed or timed out on every attempt.
    #[error("extraction failed after {attempts} attempt(s): {message}")]
    ExtractionFailure { attempts: u32, message: String },

    /// The Embedder failed or timed out on every attempt.
    #[error("embedding failed after {attempts} attempt(s): {message}")]
    EmbeddingFailure { attempts: u32, message: String },

    /// An integrity violation was detected; nothing was applied.
    #[error("graph corruption: {reason} (ids: {})", join_ids(ids))]
    GraphCorruption { reason: String, ids: Vec<NoteId> },

    /// Optimistic version check failed for the listed notes.
    #[error("write conflict on {}", join_ids(ids))]
    WriteConflict { ids: Vec<NoteId> },

    /// The pending-document queue is full.
    #[error("ingestion queue full ({capacity} pending documents)")]
    Backpressure { capacity: usize },

    /// The operation was cancelled before it committed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("note not found: {0}")]
    NotFound(NoteId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    pub fn corruption(reason: impl Into<String>, ids: Vec<NoteId>) -> Self {
        Self::GraphCorruption {
            reason: reason.into(),
            ids,
        }
    }

    /// `true` for errors a caller may resolve by retrying with fresh state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConflict { .. } | Self::Backpressure { .. })
    }
}

/// Errors raised by a [`Persistence`](crate::graph::persistence::Persistence) backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("storage lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Errors raised by external capabilities (Extractor, Embedder, Summarizer).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("unavailable: {0}")]
    Unavailable(String),
}

fn join_ids(ids: &[NoteId]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
