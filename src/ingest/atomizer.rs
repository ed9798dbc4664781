use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{call_with_retry, Embedder, Extractor, RetryPolicy};
use crate::config::AtomizerConfig;
use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::types::NoteId;

/// Unstructured input to ingest.
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    /// Opaque pointer back to where the text came from.
    pub source_ref: Option<String>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_ref: None,
        }
    }

    pub fn with_source(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }
}

/// A claim that will become a note. The id is assigned up front so later
/// claims of the same document can refer to it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: NoteId,
    pub claim: String,
    pub confidence: f64,
    pub embedding: Option<Vec<f32>>,
}

/// A claim that restates an existing note (or an earlier claim of the same
/// document).
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateRef {
    pub claim: String,
    pub existing_id: NoteId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedClaim {
    pub claim: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AtomizedDocument {
    pub accepted: Vec<Candidate>,
    pub duplicates: Vec<DuplicateRef>,
    pub rejected: Vec<RejectedClaim>,
    /// Embedding failed; candidates carry no vectors and were not deduplicated.
    pub degraded: bool,
}

/// Turns a document into candidate notes: extraction, confidence gate,
/// embedding and near-duplicate detection.
pub struct Atomizer {
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    config: AtomizerConfig,
    retry: RetryPolicy,
    dedup_candidates: usize,
}

impl Atomizer {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        config: AtomizerConfig,
        dedup_candidates: usize,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            extractor,
            embedder,
            config,
            retry,
            dedup_candidates: dedup_candidates.max(1),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn atomize(&self, doc: &Document, graph: &Graph) -> Result<AtomizedDocument> {
        let claims = call_with_retry(&self.retry, "extract", || self.extractor.extract(&doc.text))
            .await
            .map_err(|e| EngineError::ExtractionFailure {
                attempts: e.attempts,
                message: e.last_error.to_string(),
            })?;
        debug!(claims = claims.len(), "extracted claims");

        let mut out = AtomizedDocument::default();
        for extracted in claims {
            let claim = extracted.claim.trim();
            if claim.is_empty()
                || !extracted.confidence.is_finite()
                || extracted.confidence < self.config.extract_confidence
            {
                debug!(claim, confidence = extracted.confidence, "claim rejected");
                out.rejected.push(RejectedClaim {
                    claim: claim.to_string(),
                    confidence: extracted.confidence,
                });
                continue;
            }

            let embedding = if out.degraded {
                None
            } else {
                match call_with_retry(&self.retry, "embed", || self.embedder.embed(claim)).await {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        let err = EngineError::EmbeddingFailure {
                            attempts: e.attempts,
                            message: e.last_error.to_string(),
                        };
                        warn!(error = %err, "document degraded to structural linking");
                        out.degraded = true;
                        None
                    }
                }
            };

            if let Some(vector) = &embedding {
                if let Some(dup) = self.find_duplicate(claim, vector, graph, &out.accepted).await {
                    debug!(claim, existing = %dup.existing_id, similarity = dup.similarity, "duplicate claim");
                    out.duplicates.push(dup);
                    continue;
                }
            }

            out.accepted.push(Candidate {
                id: NoteId::generate(),
                claim: claim.to_string(),
                confidence: extracted.confidence,
                embedding,
            });
        }
        Ok(out)
    }

    /// Most similar active layer-0 note or earlier candidate at or above the
    /// dedup threshold.
    async fn find_duplicate(
        &self,
        claim: &str,
        vector: &[f32],
        graph: &Graph,
        accepted: &[Candidate],
    ) -> Option<DuplicateRef> {
        let threshold = self.config.dedup_similarity;
        let mut best: Option<(NoteId, f32)> = None;
        let mut consider = |id: NoteId, similarity: f32| {
            if f64::from(similarity) >= threshold
                && best.as_ref().map_or(true, |(_, s)| similarity > *s)
            {
                best = Some((id, similarity));
            }
        };

        for candidate in accepted {
            if let Some(other) = &candidate.embedding {
                consider(candidate.id.clone(), self.embedder.similarity(vector, other));
            }
        }

        match call_with_retry(&self.retry, "nearest", || {
            self.embedder.nearest(vector, self.dedup_candidates, Some(0))
        })
        .await
        {
            Ok(hits) => {
                for (id, similarity) in hits {
                    let live = graph.get(&id).is_some_and(|n| n.is_active() && n.layer == 0);
                    if live {
                        consider(id, similarity);
                    }
                }
            }
            Err(e) => warn!(error = %e.last_error, "near-duplicate search unavailable"),
        }

        best.map(|(existing_id, similarity)| DuplicateRef {
            claim: claim.to_string(),
            existing_id,
            similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{StubEmbedder, StubExtractor};
    use crate::error::CapabilityError;
    use crate::graph::types::AtomicNote;
    use chrono::Utc;

    fn fast_config() -> AtomizerConfig {
        AtomizerConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            call_timeout_ms: 1000,
            ..AtomizerConfig::default()
        }
    }

    #[tokio::test]
    async fn low_confidence_and_blank_claims_are_rejected() {
        let extractor = StubExtractor::new().with_confidence("Maybe it rains", 0.2);
        let atomizer = Atomizer::new(
            Arc::new(extractor),
            Arc::new(StubEmbedder::new()),
            fast_config(),
            8,
        );
        let out = atomizer
            .atomize(&Document::new("Paris is the capital of France. Maybe it rains."), &Graph::new())
            .await
            .unwrap();
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].claim, "Maybe it rains");
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn extraction_failure_after_retries() {
        let extractor = Arc::new(StubExtractor::new());
        extractor.fail_next(5, CapabilityError::Unavailable("model offline".into()));
        let atomizer = Atomizer::new(extractor.clone(), Arc::new(StubEmbedder::new()), fast_config(), 8);

        let err = atomizer
            .atomize(&Document::new("Anything."), &Graph::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExtractionFailure { attempts: 3, .. }));
        assert_eq!(extractor.calls(), 3);
    }

    #[tokio::test]
    async fn duplicates_of_existing_and_earlier_claims() {
        let embedder = Arc::new(StubEmbedder::new());
        let existing = AtomicNote::new("Paris is the capital of France", Utc::now());
        let vector = embedder.vector_for(&existing.content);
        embedder.index(&existing.id, &vector, 0).await.unwrap();
        let graph = Graph::from_parts(vec![existing.clone()], vec![]);

        let atomizer = Atomizer::new(Arc::new(StubExtractor::new()), embedder, fast_config(), 8);
        let out = atomizer
            .atomize(
                &Document::new("The capital of France is Paris. Octopuses have three hearts. Three hearts, octopuses have."),
                &graph,
            )
            .await
            .unwrap();

        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.duplicates.len(), 2);
        assert_eq!(out.duplicates[0].existing_id, existing.id);
        assert_eq!(out.duplicates[1].existing_id, out.accepted[0].id);
    }

    #[tokio::test]
    async fn archived_notes_are_not_duplicate_targets() {
        let embedder = Arc::new(StubEmbedder::new());
        let mut archived = AtomicNote::new("Paris is the capital of France", Utc::now());
        archived.status = crate::graph::types::NoteStatus::Archived;
        let vector = embedder.vector_for(&archived.content);
        embedder.index(&archived.id, &vector, 0).await.unwrap();
        let graph = Graph::from_parts(vec![archived], vec![]);

        let atomizer = Atomizer::new(Arc::new(StubExtractor::new()), embedder, fast_config(), 8);
        let out = atomizer
            .atomize(&Document::new("Paris is the capital of France."), &graph)
            .await
            .unwrap();
        assert_eq!(out.accepted.len(), 1);
        assert!(out.duplicates.is_empty());
    }

    #[tokio::test]
    async fn embedding_outage_degrades_document() {
        let embedder = Arc::new(StubEmbedder::new());
        embedder.set_unavailable(true);
        let atomizer = Atomizer::new(Arc::new(StubExtractor::new()), embedder.clone(), fast_config(), 8);
        let out = atomizer
            .atomize(&Document::new("First claim here. Second claim here."), &Graph::new())
            .await
            .unwrap();
        assert!(out.degraded);
        assert_eq!(out.accepted.len(), 2);
        assert!(out.accepted.iter().all(|c| c.embedding.is_none()));
        // Retried for the first claim only; the rest skip embedding.
        assert_eq!(embedder.embed_calls(), 3);
    }
}
