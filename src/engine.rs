//! The core surface: ingest documents, traverse the graph, run consolidation.
//!
//! [`MemoryEngine`] wires the [`Atomizer`], [`Linker`], [`GraphStore`] and
//! [`ConsolidationEngine`] together. Capability calls (extraction, embedding,
//! summarization) always happen outside the store's commit lock; each document
//! is staged in full and committed as one transaction.

use anyhow::Context;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capability::{call_with_retry, Capabilities, Embedder, RetryPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::consolidation::{CancelFlag, ConsolidationEngine, ConsolidationReport, RelevancePolicy};
use crate::error::{EngineError, Result};
use crate::graph::{
    AtomicNote, BatchKind, GraphStats, GraphStore, MemoryPersistence, NoteId, Persistence,
    Relation, SqlitePersistence, Subgraph, Transaction, TraversalFilter,
};
use crate::ingest::{AtomizedDocument, Atomizer, Document, DuplicateRef, LinkSubject, Linker, RejectedClaim};

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestResult {
    /// Notes created, in claim order.
    pub created_ids: Vec<NoteId>,
    /// Claims that restated an existing note; the existing note was reinforced.
    pub duplicates: Vec<DuplicateRef>,
    /// Created notes no link could be found for. Flagged for the next relink pass.
    pub orphans: Vec<NoteId>,
    pub rejected: Vec<RejectedClaim>,
    /// Embedding or similarity search was unavailable; links are structural only.
    pub degraded: bool,
}

/// A staged document, ready to commit.
struct Plan {
    tx: Transaction,
    reinforced: Vec<NoteId>,
    semantic_degraded: bool,
}

pub struct MemoryEngine {
    store: Arc<GraphStore>,
    atomizer: Atomizer,
    linker: Arc<Linker>,
    consolidation: ConsolidationEngine,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    pending: Semaphore,
    ingested: AtomicU64,
    cycles: AtomicU64,
    ingest_signal: Notify,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("store", &self.store)
            .field("ingested", &self.ingested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Open the configured backend, load the graph and re-register stored
    /// embeddings with the embedder.
    pub async fn open(config: EngineConfig, capabilities: Capabilities) -> anyhow::Result<Self> {
        config.validate()?;
        let persistence: Arc<dyn Persistence> = match config.storage.backend.as_str() {
            "memory" => Arc::new(MemoryPersistence::new()),
            _ => {
                let path = config.resolved_db_path();
                let sqlite = SqlitePersistence::open(&path)
                    .with_context(|| format!("failed to open graph database at {}", path.display()))?;
                Arc::new(sqlite)
            }
        };
        let policy = RelevancePolicy::from_config(&config.consolidation);
        let store = GraphStore::open(persistence, config.graph.clone(), policy)
            .context("failed to load graph")?;

        let engine = Self::new(Arc::new(store), capabilities, config, Arc::new(SystemClock));
        let indexed = engine.reindex_embeddings().await;
        info!(
            backend = %engine.config.storage.backend,
            indexed,
            "memory engine ready"
        );
        Ok(engine)
    }

    pub fn new(
        store: Arc<GraphStore>,
        capabilities: Capabilities,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.atomizer);
        let Capabilities {
            extractor,
            embedder,
            summarizer,
        } = capabilities;
        let atomizer = Atomizer::new(
            extractor,
            Arc::clone(&embedder),
            config.atomizer.clone(),
            config.linker.top_k,
        );
        let linker = Arc::new(Linker::new(
            Arc::clone(&embedder),
            config.linker.clone(),
            retry.clone(),
        ));
        let consolidation = ConsolidationEngine::new(
            Arc::clone(&store),
            Arc::clone(&linker),
            summarizer,
            Arc::clone(&embedder),
            config.consolidation.clone(),
            retry.clone(),
            Arc::clone(&clock),
        );
        let pending = Semaphore::new(config.ingest.max_pending_documents);
        Self {
            store,
            atomizer,
            linker,
            consolidation,
            embedder,
            retry,
            config,
            clock,
            pending,
            ingested: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            ingest_signal: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hand every stored embedding to the embedder so similarity search covers
    /// notes persisted by earlier runs. Returns how many were indexed.
    pub async fn reindex_embeddings(&self) -> usize {
        let graph = self.store.snapshot();
        let mut indexed = 0;
        for note in graph.notes().filter(|n| n.is_active()) {
            if let Some(vector) = &note.embedding {
                if self.index(&note.id, vector, note.layer).await {
                    indexed += 1;
                }
            }
        }
        indexed
    }

    pub async fn ingest(&self, doc: Document) -> Result<IngestResult> {
        self.ingest_with_cancel(doc, &CancelFlag::new()).await
    }

    /// Atomize, link and commit one document. Nothing is written unless the
    /// whole document commits; cancelling before the commit leaves no trace.
    pub async fn ingest_with_cancel(&self, doc: Document, cancel: &CancelFlag) -> Result<IngestResult> {
        let _permit = self.pending.try_acquire().map_err(|_| EngineError::Backpressure {
            capacity: self.config.ingest.max_pending_documents,
        })?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let atomized = self.atomizer.atomize(&doc, &self.store.snapshot()).await?;

        let mut attempts = 0;
        let (reinforced, semantic_degraded) = loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let plan = self.plan(&doc, &atomized).await?;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.store.commit_tx(plan.tx) {
                Ok(_) => break (plan.reinforced, plan.semantic_degraded),
                Err(e @ EngineError::WriteConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.store.config().max_commit_retries {
                        warn!(attempts, error = %e, "ingestion gave up after repeated conflicts");
                        return Err(e);
                    }
                    debug!(attempts, error = %e, "re-linking document against a fresh snapshot");
                }
                Err(e) => return Err(e),
            }
        };

        for candidate in &atomized.accepted {
            if let Some(vector) = &candidate.embedding {
                self.index(&candidate.id, vector, 0).await;
            }
        }
        for id in &reinforced {
            self.store.push_access_event(id.clone());
        }

        let graph = self.store.snapshot();
        let created_ids: Vec<NoteId> = atomized.accepted.iter().map(|c| c.id.clone()).collect();
        let orphans: Vec<NoteId> = created_ids
            .iter()
            .filter(|id| graph.get(id).is_some_and(|n| n.needs_relink))
            .cloned()
            .collect();
        let result = IngestResult {
            created_ids,
            duplicates: atomized.duplicates,
            orphans,
            rejected: atomized.rejected,
            degraded: atomized.degraded || semantic_degraded,
        };
        info!(
            source = doc.source_ref.as_deref().unwrap_or("-"),
            created = result.created_ids.len(),
            duplicates = result.duplicates.len(),
            orphans = result.orphans.len(),
            rejected = result.rejected.len(),
            degraded = result.degraded,
            "document ingested"
        );

        let done = self.ingested.fetch_add(1, Ordering::SeqCst) + 1;
        let trigger = self.config.consolidation.trigger_after_ingestions;
        if trigger > 0 && done % trigger == 0 {
            self.ingest_signal.notify_one();
        }
        Ok(result)
    }

    /// Stage the document's notes, their links and the reinforcement of
    /// restated notes against the current snapshot.
    async fn plan(&self, doc: &Document, atomized: &AtomizedDocument) -> Result<Plan> {
        let snapshot = self.store.snapshot();
        let now = self.clock.now();
        let policy = self.store.policy();
        let mut tx = Transaction::new(BatchKind::Ingest, Arc::clone(&snapshot));
        let mut peers: Vec<LinkSubject> = Vec::with_capacity(atomized.accepted.len());
        let mut semantic_degraded = false;

        for candidate in &atomized.accepted {
            let mut note = AtomicNote::new(candidate.claim.clone(), now);
            note.id = candidate.id.clone();
            note.source_ref = doc.source_ref.clone();
            note.embedding = candidate.embedding.clone();
            note.next_review_at = now + policy.review_interval;

            let subject = LinkSubject::from_note(&note);
            let proposal = self.linker.propose(&subject, &peers, &snapshot, now).await;
            semantic_degraded |= proposal.semantic_degraded;
            tx.put_note(note);
            tx.extend_read_set(&proposal.read_set);
            for edge in proposal.edges {
                tx.add_edge(edge);
            }
            peers.push(subject);
        }

        let mut reinforced: Vec<NoteId> = Vec::new();
        for dup in &atomized.duplicates {
            // Restating an earlier claim of this document, or a note that
            // left the active set since atomization.
            let Some(existing) = snapshot.get(&dup.existing_id).filter(|n| n.is_active()) else {
                continue;
            };
            let subject = LinkSubject::from_note(existing);
            for edge in self.linker.link_duplicate(&subject, &peers, now) {
                tx.add_edge(edge);
            }
            if !reinforced.contains(&existing.id) {
                tx.update_note(&existing.id, |n| policy.reinforce(n, now))?;
                reinforced.push(existing.id.clone());
            }
        }

        Ok(Plan {
            tx,
            reinforced,
            semantic_degraded,
        })
    }

    /// Notes within `depth` hops of the seeds. Archived and failed notes are
    /// excluded; every active seed counts as accessed. Seeds whose access
    /// could not be persisted are listed in [`Subgraph::unrecorded`].
    pub fn query_neighbors(
        &self,
        seeds: &[NoteId],
        depth: usize,
        relations: Option<&[Relation]>,
    ) -> Result<Subgraph> {
        let filter = relations.map_or_else(TraversalFilter::default, |r| {
            TraversalFilter::relations(r.iter().copied())
        });
        let mut subgraph = self.store.get_neighbors(seeds, depth, &filter)?;
        let now = self.clock.now();
        let reached: Vec<NoteId> = seeds
            .iter()
            .filter(|id| subgraph.contains(id))
            .cloned()
            .collect();
        for id in reached {
            if let Err(e) = self.store.record_access(&id, now) {
                warn!(%id, error = %e, "access not recorded");
                subgraph.unrecorded.push(id);
            }
        }
        Ok(subgraph)
    }

    pub async fn run_consolidation_cycle(&self, batch_size: usize) -> Result<ConsolidationReport> {
        self.run_consolidation_cycle_with_cancel(batch_size, &CancelFlag::new())
            .await
    }

    pub async fn run_consolidation_cycle_with_cancel(
        &self,
        batch_size: usize,
        cancel: &CancelFlag,
    ) -> Result<ConsolidationReport> {
        let report = self.consolidation.run_cycle(batch_size, cancel).await?;
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    /// Consolidation cycles completed since the engine was created.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run consolidation every `interval_secs`, and after every
    /// `trigger_after_ingestions` ingestions, until `shutdown` turns `true` or
    /// its sender is dropped. A cycle in flight at shutdown is cancelled
    /// between actions.
    pub fn spawn_consolidation_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let period = engine.config.consolidation.interval_secs;
            let batch_size = engine.config.consolidation.default_batch_size;
            let mut ticker = tokio::time::interval(Duration::from_secs(period.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(
                interval_secs = period,
                trigger_after = engine.config.consolidation.trigger_after_ingestions,
                "consolidation scheduler started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick(), if period > 0 => {}
                    _ = engine.ingest_signal.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                let cancel = CancelFlag::new();
                let cycle = engine.run_consolidation_cycle_with_cancel(batch_size, &cancel);
                tokio::pin!(cycle);
                let outcome = tokio::select! {
                    outcome = &mut cycle => outcome,
                    _ = shutdown.changed() => {
                        cancel.cancel();
                        cycle.await
                    }
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "scheduled consolidation cycle failed");
                }
            }
            info!("consolidation scheduler stopped");
        })
    }

    pub fn stats(&self) -> GraphStats {
        self.store.stats(self.clock.now())
    }

    pub fn provenance(&self, id: &NoteId) -> Result<Vec<AtomicNote>> {
        self.store.provenance(id)
    }

    pub fn get_note(&self, id: &NoteId) -> Option<AtomicNote> {
        self.store.get_note(id)
    }

    async fn index(&self, id: &NoteId, vector: &[f32], layer: u32) -> bool {
        match call_with_retry(&self.retry, "index", || self.embedder.index(id, vector, layer)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%id, error = %e.last_error, "embedding index update failed");
                false
            }
        }
    }
}
