use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cluster;
use super::decay::RelevancePolicy;
use crate::capability::{call_with_retry, Embedder, RetryPolicy, Summarizer};
use crate::clock::Clock;
use crate::config::ConsolidationConfig;
use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::persistence::BatchKind;
use crate::graph::store::{quarantine, GraphStore};
use crate::graph::transaction::Transaction;
use crate::graph::types::{AtomicNote, Edge, NoteId, NoteStatus, Relation};
use crate::ingest::{LinkSubject, Linker};

/// Counts for one consolidation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub reviewed: usize,
    /// Reviewed notes whose stored relevance changed.
    pub decayed: usize,
    /// Distinct notes accessed since the previous cycle.
    pub reinforced: usize,
    pub archived: usize,
    pub summarized: usize,
    pub relinked: usize,
    pub quarantined: usize,
    /// Actions abandoned on a version conflict; their notes stay due.
    pub conflicts: usize,
    pub cancelled: bool,
}

impl ConsolidationReport {
    pub fn mutated(&self) -> bool {
        self.decayed + self.archived + self.summarized + self.relinked + self.quarantined > 0
    }
}

/// Cooperative cancellation, checked between actions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What reviewing one due note did.
#[derive(Debug)]
enum Outcome {
    Rescheduled { decayed: bool },
    Relinked { decayed: bool, linked: bool },
    Archived { count: usize },
    Summarized { members: usize },
    Quarantined,
    Deferred,
}

/// Decay, pruning, summarization and relinking over the review queue.
/// Each action commits on its own; nothing here holds a lock across an await.
pub struct ConsolidationEngine {
    store: Arc<GraphStore>,
    linker: Arc<Linker>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    config: ConsolidationConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<GraphStore>,
        linker: Arc<Linker>,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
        config: ConsolidationConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            linker,
            summarizer,
            embedder,
            config,
            retry,
            clock,
        }
    }

    fn policy(&self) -> &RelevancePolicy {
        self.store.policy()
    }

    /// Review up to `batch_size` due notes, earliest first.
    pub async fn run_cycle(
        &self,
        batch_size: usize,
        cancel: &CancelFlag,
    ) -> Result<ConsolidationReport> {
        let now = self.clock.now();
        let mut report = ConsolidationReport {
            reinforced: self
                .store
                .drain_access_events()
                .into_iter()
                .collect::<BTreeSet<_>>()
                .len(),
            ..ConsolidationReport::default()
        };

        let due = self.store.due_for_review(now, batch_size);
        let mut handled: BTreeSet<NoteId> = BTreeSet::new();

        for id in due {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(reviewed = report.reviewed, "consolidation cycle cancelled");
                break;
            }
            if handled.contains(&id) {
                continue;
            }
            let snapshot = self.store.snapshot();
            let Some(note) = snapshot.get(&id).filter(|n| n.is_active()).cloned() else {
                continue;
            };
            report.reviewed += 1;

            match self.review(&snapshot, note, now, &mut handled).await {
                Ok(Outcome::Rescheduled { decayed }) => report.decayed += usize::from(decayed),
                Ok(Outcome::Relinked { decayed, linked }) => {
                    report.decayed += usize::from(decayed);
                    report.relinked += usize::from(linked);
                }
                Ok(Outcome::Archived { count }) => report.archived += count,
                Ok(Outcome::Summarized { members }) => {
                    report.summarized += 1;
                    report.archived += members;
                }
                Ok(Outcome::Quarantined) => report.quarantined += 1,
                Ok(Outcome::Deferred) => {}
                Err(EngineError::WriteConflict { ids }) => {
                    debug!(%id, conflicting = ?ids, "consolidation action conflicted, left due");
                    report.conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            reviewed = report.reviewed,
            decayed = report.decayed,
            reinforced = report.reinforced,
            archived = report.archived,
            summarized = report.summarized,
            relinked = report.relinked,
            conflicts = report.conflicts,
            "consolidation cycle complete"
        );
        Ok(report)
    }

    async fn review(
        &self,
        snapshot: &Arc<Graph>,
        note: AtomicNote,
        now: DateTime<Utc>,
        handled: &mut BTreeSet<NoteId>,
    ) -> Result<Outcome> {
        if RelevancePolicy::is_corrupt(&note) {
            warn!(id = %note.id, relevance = note.relevance, "quarantining note with corrupt relevance");
            let mut tx = Transaction::new(BatchKind::Update, Arc::clone(snapshot));
            tx.update_note(&note.id, quarantine)?;
            self.store.commit_tx(tx)?;
            return Ok(Outcome::Quarantined);
        }

        let mut current = note;
        let decayed = self.policy().apply_decay(&mut current, now);

        if self.policy().is_prune_candidate(&current, now) {
            return self.prune(snapshot, &current, now, handled).await;
        }

        current.next_review_at = now + self.policy().review_interval;
        if current.needs_relink {
            return self.relink(snapshot, current, decayed, now).await;
        }

        let mut tx = Transaction::new(BatchKind::Decay, Arc::clone(snapshot));
        tx.put_note(current);
        self.store.commit_tx(tx)?;
        Ok(Outcome::Rescheduled { decayed })
    }

    async fn relink(
        &self,
        snapshot: &Arc<Graph>,
        mut note: AtomicNote,
        decayed: bool,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let mut fresh_embedding = false;
        if note.embedding.is_none() {
            if let Ok(vector) =
                call_with_retry(&self.retry, "embed", || self.embedder.embed(&note.content)).await
            {
                note.embedding = Some(vector);
                fresh_embedding = true;
            }
        }

        let proposal = self
            .linker
            .propose(&LinkSubject::from_note(&note), &[], snapshot, now)
            .await;
        let linked = !proposal.edges.is_empty();

        let mut tx = Transaction::new(BatchKind::Relink, Arc::clone(snapshot));
        tx.extend_read_set(&proposal.read_set);
        let (id, layer, embedding) = (note.id.clone(), note.layer, note.embedding.clone());
        tx.put_note(note);
        for edge in proposal.edges {
            tx.add_edge(edge);
        }
        self.store.commit_tx(tx)?;

        if let (true, Some(vector)) = (fresh_embedding, embedding) {
            self.index(&id, &vector, layer).await;
        }
        debug!(%id, linked, "relink pass");
        Ok(Outcome::Relinked { decayed, linked })
    }

    async fn prune(
        &self,
        snapshot: &Arc<Graph>,
        note: &AtomicNote,
        now: DateTime<Utc>,
        handled: &mut BTreeSet<NoteId>,
    ) -> Result<Outcome> {
        let policy = self.policy();
        let degree = snapshot.active_degree(&note.id);
        let members = cluster::cohesive_component(snapshot, &note.id, |peer| {
            !handled.contains(&peer.id) && policy.is_prune_candidate(peer, now)
        });

        let direct = degree == 0
            || (members.len() == 1 && degree <= self.config.low_centrality_max_degree);
        let summarizable = members.len() >= self.config.min_cluster_size
            && !cluster::has_internal_contradiction(snapshot, &members);

        if direct || !summarizable {
            let targets: BTreeSet<NoteId> = if direct {
                BTreeSet::from([note.id.clone()])
            } else {
                members
            };
            let mut tx = Transaction::new(BatchKind::Archive, Arc::clone(snapshot));
            for id in &targets {
                let Some(member) = snapshot.get(id) else { continue };
                let mut member = member.clone();
                policy.apply_decay(&mut member, now);
                member.status = NoteStatus::Archived;
                tx.put_note(member);
            }
            self.store.commit_tx(tx)?;
            debug!(id = %note.id, count = targets.len(), direct, "archived without summary");
            handled.extend(targets.iter().cloned());
            return Ok(Outcome::Archived {
                count: targets.len(),
            });
        }

        self.summarize(snapshot, &members, now, handled).await
    }

    async fn summarize(
        &self,
        snapshot: &Arc<Graph>,
        members: &BTreeSet<NoteId>,
        now: DateTime<Utc>,
        handled: &mut BTreeSet<NoteId>,
    ) -> Result<Outcome> {
        let mut notes: Vec<AtomicNote> = members
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .collect();
        notes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let contents: Vec<String> = notes.iter().map(|n| n.content.clone()).collect();

        let content = match call_with_retry(&self.retry, "summarize", || {
            self.summarizer.summarize(&contents)
        })
        .await
        {
            Ok(content) if !content.trim().is_empty() => content,
            Ok(_) => {
                warn!(members = notes.len(), "summarizer returned nothing, cluster left due");
                return Ok(Outcome::Deferred);
            }
            Err(e) => {
                warn!(members = notes.len(), error = %e.last_error, "summarizer unavailable, cluster left due");
                return Ok(Outcome::Deferred);
            }
        };

        let layer = notes.iter().map(|n| n.layer).max().unwrap_or(0) + 1;
        let embedding = call_with_retry(&self.retry, "embed", || self.embedder.embed(&content))
            .await
            .ok();

        let mut summary = AtomicNote::new(content, now)
            .with_layer(layer)
            .with_relevance(self.config.summary_relevance);
        summary.is_root = true;
        summary.next_review_at = now + self.policy().review_interval;
        summary.embedding = embedding.clone();

        let mut tx = Transaction::new(BatchKind::Summarize, Arc::clone(snapshot));
        tx.put_note(summary.clone());
        for member in &notes {
            let mut archived = member.clone();
            self.policy().apply_decay(&mut archived, now);
            archived.status = NoteStatus::Archived;
            tx.put_note(archived);
            tx.add_edge(Edge::new(
                summary.id.clone(),
                member.id.clone(),
                Relation::DerivedFrom,
                1.0,
                now,
            ));
        }
        let mut rewired = 0;
        for member in &notes {
            rewired += tx.rewire(&member.id, &summary.id, members);
        }
        self.store.commit_tx(tx)?;

        if let Some(vector) = embedding {
            self.index(&summary.id, &vector, layer).await;
        }
        info!(
            summary = %summary.id,
            layer,
            members = notes.len(),
            rewired,
            "cluster summarized"
        );
        handled.extend(members.iter().cloned());
        Ok(Outcome::Summarized {
            members: notes.len(),
        })
    }

    async fn index(&self, id: &NoteId, vector: &[f32], layer: u32) {
        if let Err(e) =
            call_with_retry(&self.retry, "index", || self.embedder.index(id, vector, layer)).await
        {
            warn!(%id, error = %e.last_error, "embedding index update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BulletSummarizer, StubEmbedder};
    use crate::clock::ManualClock;
    use crate::config::{GraphConfig, LinkerConfig};
    use crate::error::CapabilityError;
    use crate::graph::transaction::ReadSet;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            call_timeout: StdDuration::from_secs(1),
            initial_backoff: StdDuration::from_millis(1),
            max_backoff: StdDuration::from_millis(2),
        }
    }

    struct Fixture {
        store: Arc<GraphStore>,
        clock: Arc<ManualClock>,
        engine: ConsolidationEngine,
    }

    fn fixture_with(summarizer: Arc<dyn Summarizer>, store: Arc<GraphStore>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new());
        let linker = Arc::new(Linker::new(
            Arc::clone(&embedder),
            LinkerConfig::default(),
            fast_retry(),
        ));
        let engine = ConsolidationEngine::new(
            Arc::clone(&store),
            linker,
            summarizer,
            embedder,
            ConsolidationConfig::default(),
            fast_retry(),
            clock.clone(),
        );
        Fixture {
            store,
            clock,
            engine,
        }
    }

    fn new_store() -> Arc<GraphStore> {
        Arc::new(
            GraphStore::in_memory(
                GraphConfig::default(),
                RelevancePolicy::from_config(&ConsolidationConfig::default()),
            )
            .unwrap(),
        )
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(BulletSummarizer::default()), new_store())
    }

    /// A note that dropped under the threshold ten days before `now`.
    fn faded(content: &str, now: DateTime<Utc>) -> AtomicNote {
        AtomicNote::new(content, now - Duration::days(10)).with_relevance(0.05)
    }

    fn mesh(ids: &[NoteId], now: DateTime<Utc>) -> Vec<Edge> {
        let mut edges = Vec::new();
        for (i, from) in ids.iter().enumerate() {
            for to in &ids[i + 1..] {
                edges.push(Edge::new(from.clone(), to.clone(), Relation::Supports, 0.8, now));
            }
        }
        edges
    }

    #[tokio::test]
    async fn isolated_faded_note_is_archived_directly() {
        let f = fixture();
        let now = f.clock.now();
        let note = faded("Ferns reproduce with spores", now);
        f.store.commit(note.clone(), vec![]).unwrap();

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.reviewed, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(report.summarized, 0);
        assert_eq!(f.store.get_note(&note.id).unwrap().status, NoteStatus::Archived);
    }

    #[tokio::test]
    async fn faded_cluster_becomes_one_summary() {
        let f = fixture();
        let now = f.clock.now();
        let members: Vec<AtomicNote> = (0..5)
            .map(|i| faded(&format!("Glacier fact number {i}"), now))
            .collect();
        let ids: Vec<NoteId> = members.iter().map(|n| n.id.clone()).collect();
        let mut outside = AtomicNote::new("Ice sheets shape valleys", now);
        outside.next_review_at = now + Duration::days(30);
        let mut edges = mesh(&ids, now);
        edges.push(Edge::new(outside.id.clone(), ids[0].clone(), Relation::Elaborates, 0.4, now));
        edges.push(Edge::new(outside.id.clone(), ids[3].clone(), Relation::Elaborates, 0.7, now));
        let mut notes = members.clone();
        notes.push(outside.clone());
        f.store.commit_batch(notes, edges, &ReadSet::new()).unwrap();

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.summarized, 1);
        assert_eq!(report.archived, 5);

        let graph = f.store.snapshot();
        let summary = graph.notes().find(|n| n.is_summary()).unwrap().clone();
        assert_eq!(summary.layer, 1);
        assert!(summary.is_active());

        let mut derived = graph.derived_members(&summary.id);
        derived.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(derived, expected);
        for id in &ids {
            assert_eq!(graph.get(id).unwrap().status, NoteStatus::Archived);
        }

        let rewired: Vec<&Edge> = graph
            .outgoing(&outside.id)
            .filter(|e| e.to == summary.id)
            .collect();
        assert_eq!(rewired.len(), 1);
        assert_eq!(rewired[0].relation, Relation::Elaborates);
        assert!((rewired[0].weight - 0.7).abs() < 1e-9);
        assert!(!graph.get(&outside.id).unwrap().needs_relink);
        graph.verify().unwrap();
    }

    #[tokio::test]
    async fn contradicting_cluster_is_archived_member_by_member() {
        let f = fixture();
        let now = f.clock.now();
        let notes: Vec<AtomicNote> = ["Tide one", "Tide two", "Tide three"]
            .into_iter()
            .map(|c| faded(c, now))
            .collect();
        let ids: Vec<NoteId> = notes.iter().map(|n| n.id.clone()).collect();
        let edges = vec![
            Edge::new(ids[0].clone(), ids[1].clone(), Relation::Supports, 0.8, now),
            Edge::new(ids[1].clone(), ids[2].clone(), Relation::Supports, 0.8, now),
            Edge::new(ids[2].clone(), ids[0].clone(), Relation::Contradicts, 0.8, now),
        ];
        f.store.commit_batch(notes, edges, &ReadSet::new()).unwrap();

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.summarized, 0);
        assert_eq!(report.archived, 3);
        assert!(f.store.snapshot().notes().all(|n| !n.is_summary()));
    }

    #[tokio::test]
    async fn second_cycle_at_same_instant_changes_nothing() {
        let f = fixture();
        let now = f.clock.now();
        let fresh = AtomicNote::new("Basalt cools quickly", now);
        let old = faded("Pumice floats", now);
        f.store.commit_batch(vec![fresh, old], vec![], &ReadSet::new()).unwrap();

        let first = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();
        assert!(first.reviewed > 0);
        let before = f.store.snapshot();

        let second = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();
        assert_eq!(second.reviewed, 0);
        assert!(!second.mutated());
        let after = f.store.snapshot();
        for note in before.notes() {
            assert_eq!(after.get(&note.id), Some(note));
        }
    }

    #[tokio::test]
    async fn cancelled_cycle_leaves_notes_due() {
        let f = fixture();
        let now = f.clock.now();
        let note = faded("Quartz is hard", now);
        f.store.commit(note.clone(), vec![]).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = f.engine.run_cycle(10, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.reviewed, 0);
        assert_eq!(f.store.due_for_review(now, 10), vec![note.id.clone()]);
    }

    #[tokio::test]
    async fn orphan_is_relinked_to_overlapping_note() {
        let f = fixture();
        let now = f.clock.now();
        let a = AtomicNote::new("The capital of France is Paris", now);
        let b = AtomicNote::new("Paris is the capital city of France", now);
        f.store
            .commit_batch(vec![a.clone(), b.clone()], vec![], &ReadSet::new())
            .unwrap();
        assert!(f.store.get_note(&a.id).unwrap().needs_relink);

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.relinked, 1);
        let graph = f.store.snapshot();
        assert!(graph.has_active_connection(&a.id));
        assert!(!graph.get(&a.id).unwrap().needs_relink);
        assert!(!graph.get(&b.id).unwrap().needs_relink);
    }

    #[tokio::test]
    async fn access_events_count_as_reinforced() {
        let f = fixture();
        let now = f.clock.now();
        let note = AtomicNote::new("Mica splits into sheets", now);
        f.store.commit(note.clone(), vec![]).unwrap();
        f.store.record_access(&note.id, now).unwrap();
        f.store.record_access(&note.id, now).unwrap();

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.reinforced, 1);
    }

    struct Unavailable;

    #[async_trait]
    impl Summarizer for Unavailable {
        async fn summarize(&self, _: &[String]) -> std::result::Result<String, CapabilityError> {
            Err(CapabilityError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn summarizer_outage_defers_the_cluster() {
        let f = fixture_with(Arc::new(Unavailable), new_store());
        let now = f.clock.now();
        let notes: Vec<AtomicNote> = (0..3).map(|i| faded(&format!("Dune {i}"), now)).collect();
        let ids: Vec<NoteId> = notes.iter().map(|n| n.id.clone()).collect();
        f.store
            .commit_batch(notes, mesh(&ids, now), &ReadSet::new())
            .unwrap();

        let report = f.engine.run_cycle(10, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.summarized, 0);
        assert_eq!(report.archived, 0);
        let graph = f.store.snapshot();
        assert!(ids.iter().all(|id| graph.is_active(id)));
        assert_eq!(f.store.due_for_review(now, 10).len(), 3);
    }

    /// Touches a member while the summary is being written.
    struct Meddler {
        store: Arc<GraphStore>,
        target: Mutex<Option<(NoteId, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl Summarizer for Meddler {
        async fn summarize(&self, contents: &[String]) -> std::result::Result<String, CapabilityError> {
            let pending = self.target.lock().unwrap().take();
            if let Some((id, at)) = pending {
                self.store.record_access(&id, at).unwrap();
            }
            Ok(contents.join("; "))
        }
    }

    #[tokio::test]
    async fn concurrent_access_turns_summary_into_conflict() {
        let store = new_store();
        let now = Utc::now();
        let notes: Vec<AtomicNote> = (0..3).map(|i| faded(&format!("Reef {i}"), now)).collect();
        let ids: Vec<NoteId> = notes.iter().map(|n| n.id.clone()).collect();
        store
            .commit_batch(notes, mesh(&ids, now), &ReadSet::new())
            .unwrap();
        let meddler = Arc::new(Meddler {
            store: Arc::clone(&store),
            target: Mutex::new(Some((ids[1].clone(), now))),
        });
        let f = fixture_with(meddler, store);
        f.clock.set(now);

        let report = f.engine.run_cycle(1, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.summarized, 0);
        let graph = f.store.snapshot();
        assert!(ids.iter().all(|id| graph.is_active(id)));
        assert!(graph.notes().all(|n| !n.is_summary()));
    }
}
