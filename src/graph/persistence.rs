//! Durable backing for the graph store.
//!
//! The store never talks to a database directly: it hands each validated
//! transaction to a [`Persistence`] backend as one [`WriteBatch`], which must be
//! applied atomically (all keys or none).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::PersistenceError;
use crate::graph::types::{AtomicNote, Edge, EdgeKey, NoteId};

/// Everything a backend holds.
#[derive(Debug, Default, Clone)]
pub struct PersistedGraph {
    pub notes: Vec<AtomicNote>,
    pub edges: Vec<Edge>,
}

/// Kind of mutation a batch records, used for audit trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Ingest,
    Link,
    Access,
    Decay,
    Archive,
    Summarize,
    Rewire,
    Relink,
    Update,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Link => "link",
            Self::Access => "access",
            Self::Decay => "decay",
            Self::Archive => "archive",
            Self::Summarize => "summarize",
            Self::Rewire => "rewire",
            Self::Relink => "relink",
            Self::Update => "update",
        }
    }
}

/// Key-addressed upserts and deletes to apply atomically.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub kind: BatchKind,
    pub put_notes: Vec<AtomicNote>,
    pub put_edges: Vec<Edge>,
    pub delete_edges: Vec<EdgeKey>,
}

impl WriteBatch {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            put_notes: Vec::new(),
            put_edges: Vec::new(),
            delete_edges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.put_notes.is_empty() && self.put_edges.is_empty() && self.delete_edges.is_empty()
    }
}

/// Durable key-addressed storage for notes and edges with atomic multi-key commit.
///
/// Implementations are synchronous; the store calls them while holding its
/// commit lock, so they must not call back into the store.
pub trait Persistence: Send + Sync {
    /// Read the full persisted state.
    fn load(&self) -> Result<PersistedGraph, PersistenceError>;

    /// Apply every operation in `batch`, or none of them.
    fn apply(&self, batch: &WriteBatch) -> Result<(), PersistenceError>;
}

/// In-process backend. Not durable; used for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    notes: HashMap<NoteId, AtomicNote>,
    edges: BTreeMap<EdgeKey, Edge>,
    batches_applied: u64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty batches applied so far.
    pub fn batches_applied(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.batches_applied)
            .unwrap_or_default()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<PersistedGraph, PersistenceError> {
        let state = self
            .state
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        let mut notes: Vec<AtomicNote> = state.notes.values().cloned().collect();
        notes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(PersistedGraph {
            notes,
            edges: state.edges.values().cloned().collect(),
        })
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), PersistenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| PersistenceError::LockPoisoned(e.to_string()))?;
        // A single lock guard makes the whole batch atomic to readers.
        for key in &batch.delete_edges {
            state.edges.remove(key);
        }
        for note in &batch.put_notes {
            state.notes.insert(note.id.clone(), note.clone());
        }
        for edge in &batch.put_edges {
            state.edges.insert(edge.key(), edge.clone());
        }
        if !batch.is_empty() {
            state.batches_applied += 1;
        }
        Ok(())
    }
}
