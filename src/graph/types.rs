//! Core graph type definitions.
//!
//! Defines [`NoteId`], [`NoteStatus`], [`Relation`], [`AtomicNote`] (a full note
//! record, summaries included) and [`Edge`] with its identity triple [`EdgeKey`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable, opaque note identifier (UUID v7, time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    /// Visible to default traversal and eligible for consolidation.
    Active,
    /// Kept for provenance; excluded from default traversal.
    Archived,
    /// Quarantined because its stored state is corrupt.
    Failed,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown note status: {s}")),
        }
    }
}

/// Edge relation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Elaborates,
    Supports,
    Contradicts,
    /// Summary → member. The only relation that is created across layers.
    DerivedFrom,
    TemporalFollows,
}

impl Relation {
    pub const ALL: [Relation; 5] = [
        Self::Elaborates,
        Self::Supports,
        Self::Contradicts,
        Self::DerivedFrom,
        Self::TemporalFollows,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elaborates => "elaborates",
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::DerivedFrom => "derived_from",
            Self::TemporalFollows => "temporal_follows",
        }
    }

    /// Relations along which low-relevance notes are clustered for summarization.
    pub fn is_cohesive(&self) -> bool {
        matches!(self, Self::Elaborates | Self::Supports)
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elaborates" => Ok(Self::Elaborates),
            "supports" => Ok(Self::Supports),
            "contradicts" => Ok(Self::Contradicts),
            "derived_from" => Ok(Self::DerivedFrom),
            "temporal_follows" => Ok(Self::TemporalFollows),
            _ => Err(format!("unknown relation: {s}")),
        }
    }
}

/// A note record. Layer 0 notes are atomic claims; layer > 0 notes are summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicNote {
    pub id: NoteId,
    /// Self-contained text claim (or generated abstraction for summaries).
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Relevance in `[0.0, 1.0]` as of `last_decayed_at`.
    pub relevance: f64,
    pub last_decayed_at: DateTime<Utc>,
    /// When relevance first fell under the prune threshold, if it is still under.
    pub below_threshold_since: Option<DateTime<Utc>>,
    /// Review-queue key for consolidation.
    pub next_review_at: DateTime<Utc>,
    pub layer: u32,
    /// Opaque pointer to the originating document.
    pub source_ref: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub status: NoteStatus,
    /// Committed without edges; revisited by the next relink pass.
    pub needs_relink: bool,
    /// Explicitly exempt from the reachability requirement.
    pub is_root: bool,
    /// Optimistic-concurrency version. Bumped by the store on every change.
    pub version: u64,
}

impl AtomicNote {
    /// A fresh layer-0 note with full relevance, not yet persisted (version 0).
    pub fn new(content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: NoteId::generate(),
            content: content.into(),
            created_at: now,
            last_accessed_at: now,
            relevance: 1.0,
            last_decayed_at: now,
            below_threshold_since: None,
            next_review_at: now,
            layer: 0,
            source_ref: None,
            embedding: None,
            status: NoteStatus::Active,
            needs_relink: false,
            is_root: false,
            version: 0,
        }
    }

    pub fn with_source(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == NoteStatus::Active
    }

    pub fn is_summary(&self) -> bool {
        self.layer > 0
    }
}

/// Identity of an edge: at most one edge exists per triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: NoteId,
    pub to: NoteId,
    pub relation: Relation,
}

impl EdgeKey {
    /// The endpoint that is not `id` (or `to` if `id` is neither).
    pub fn other(&self, id: &NoteId) -> &NoteId {
        if &self.to == id {
            &self.from
        } else {
            &self.to
        }
    }
}

/// A typed, weighted, directed relationship between two notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NoteId,
    pub to: NoteId,
    pub relation: Relation,
    /// Confidence / strength of the link.
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(
        from: NoteId,
        to: NoteId,
        relation: Relation,
        weight: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from,
            to,
            relation,
            weight,
            created_at,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from: self.from.clone(),
            to: self.to.clone(),
            relation: self.relation,
        }
    }
}
