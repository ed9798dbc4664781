//! External capabilities the engine consumes but does not implement.
//!
//! Claim extraction, embedding/similarity search and summarization are
//! injected as trait objects. Every call goes through [`retry::call_with_retry`]
//! so transient failures are retried with a timeout and bounded backoff.

pub mod bullet;
pub mod retry;
pub mod stub;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::error::CapabilityError;
use crate::graph::types::NoteId;

pub use bullet::{BulletListExtractor, BulletSummarizer, CompletionSummarizer};
pub use retry::{call_with_retry, RetryExhausted, RetryPolicy};
pub use stub::{StubCompletion, StubEmbedder, StubExtractor};

/// One candidate claim with the extractor's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedClaim {
    pub claim: String,
    pub confidence: f64,
}

impl ExtractedClaim {
    pub fn new(claim: impl Into<String>, confidence: f64) -> Self {
        Self {
            claim: claim.into(),
            confidence,
        }
    }
}

/// Splits free text into self-contained claims.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedClaim>, CapabilityError>;
}

/// Vector embedding and nearest-neighbour search.
///
/// The engine calls [`Embedder::index`] after a note commits so later
/// [`Embedder::nearest`] queries can return it. Results may include ids the
/// graph has since archived; callers filter against their snapshot.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;

    async fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        layer: Option<u32>,
    ) -> Result<Vec<(NoteId, f32)>, CapabilityError>;

    async fn index(&self, id: &NoteId, vector: &[f32], layer: u32) -> Result<(), CapabilityError>;

    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine(a, b)
    }
}

/// Produces the content of a summary note from its members' contents.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, contents: &[String]) -> Result<String, CapabilityError>;
}

/// Prompt in, text out. Backs the bullet-list extractor and summarizer.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CapabilityError>;
}

/// The injected capability set an engine runs with.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn Extractor>,
    pub embedder: Arc<dyn Embedder>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl Capabilities {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            extractor,
            embedder,
            summarizer,
        }
    }

    /// Deterministic in-process capabilities: sentence splitting, hashed
    /// bag-of-terms vectors and bullet-point summaries.
    pub fn stub() -> Self {
        Self::new(
            Arc::new(StubExtractor::new()),
            Arc::new(StubEmbedder::new()),
            Arc::new(BulletSummarizer::default()),
        )
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Cosine similarity; `0.0` for mismatched lengths or zero vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
