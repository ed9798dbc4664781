use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::consolidation::decay::RelevancePolicy;
use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::persistence::{BatchKind, MemoryPersistence, Persistence, WriteBatch};
use crate::graph::transaction::{ReadSet, Transaction};
use crate::graph::types::{AtomicNote, Edge, EdgeKey, NoteId, NoteStatus, Relation};

/// What a successful commit changed.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// New version of every note whose record or edge set changed.
    pub versions: BTreeMap<NoteId, u64>,
    pub edges_added: usize,
    pub edges_removed: usize,
    /// Notes the commit left without an active connection.
    pub flagged_for_relink: Vec<NoteId>,
}

impl CommitReceipt {
    pub fn is_noop(&self) -> bool {
        self.versions.is_empty() && self.edges_added == 0 && self.edges_removed == 0
    }
}

/// The authoritative graph. Reads go to an immutable snapshot; every write is
/// validated, persisted, then swapped in under a single commit lock.
pub struct GraphStore {
    graph: RwLock<Arc<Graph>>,
    commit_lock: Mutex<()>,
    persistence: Arc<dyn Persistence>,
    config: GraphConfig,
    policy: RelevancePolicy,
    access_events: Mutex<Vec<NoteId>>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("GraphStore")
            .field("notes", &snapshot.note_count())
            .field("edges", &snapshot.edge_count())
            .finish()
    }
}

impl GraphStore {
    /// Load the persisted graph, quarantine corrupt notes and audit integrity.
    pub fn open(
        persistence: Arc<dyn Persistence>,
        config: GraphConfig,
        policy: RelevancePolicy,
    ) -> Result<Self> {
        let persisted = persistence.load()?;
        let mut graph = Graph::from_parts(persisted.notes, persisted.edges);

        let corrupt: Vec<AtomicNote> = graph
            .notes()
            .filter(|n| n.status != NoteStatus::Failed && RelevancePolicy::is_corrupt(n))
            .cloned()
            .collect();
        if !corrupt.is_empty() {
            let mut batch = WriteBatch::new(BatchKind::Update);
            for mut note in corrupt {
                warn!(id = %note.id, relevance = note.relevance, "quarantining note with corrupt relevance");
                quarantine(&mut note);
                graph.insert_note(note.clone());
                batch.put_notes.push(note);
            }
            persistence.apply(&batch)?;
        }

        graph.verify()?;
        info!(
            notes = graph.note_count(),
            edges = graph.edge_count(),
            "graph store opened"
        );

        Ok(Self {
            graph: RwLock::new(Arc::new(graph)),
            commit_lock: Mutex::new(()),
            persistence,
            config,
            policy,
            access_events: Mutex::new(Vec::new()),
        })
    }

    /// A store backed by [`MemoryPersistence`].
    pub fn in_memory(config: GraphConfig, policy: RelevancePolicy) -> Result<Self> {
        Self::open(Arc::new(MemoryPersistence::new()), config, policy)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn policy(&self) -> &RelevancePolicy {
        &self.policy
    }

    /// Current immutable view of the graph. Never blocks on writers for longer
    /// than an `Arc` swap.
    pub fn snapshot(&self) -> Arc<Graph> {
        let guard = self.graph.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Any note by id, regardless of status.
    pub fn get_note(&self, id: &NoteId) -> Option<AtomicNote> {
        self.snapshot().get(id).cloned()
    }

    pub fn begin(&self, kind: BatchKind) -> Transaction {
        Transaction::new(kind, self.snapshot())
    }

    /// Insert a new note or update an existing one. An existing note must carry
    /// the version it was read at.
    pub fn upsert_note(&self, mut note: AtomicNote) -> Result<NoteId> {
        if note.id.is_empty() {
            note.id = NoteId::generate();
        }
        let mut tx = self.begin(BatchKind::Update);
        if tx.base().contains(&note.id) {
            tx.expect_version(note.id.clone(), note.version);
        }
        let id = note.id.clone();
        tx.put_note(note);
        self.commit_tx(tx)?;
        Ok(id)
    }

    /// Atomically add one note and its edges.
    pub fn commit(&self, note: AtomicNote, edges: Vec<Edge>) -> Result<CommitReceipt> {
        self.commit_batch(vec![note], edges, &ReadSet::new())
    }

    /// Atomically add notes and edges, failing with `WriteConflict` if any note
    /// in `read_set` has moved past the recorded version.
    pub fn commit_batch(
        &self,
        notes: Vec<AtomicNote>,
        edges: Vec<Edge>,
        read_set: &ReadSet,
    ) -> Result<CommitReceipt> {
        let mut tx = self.begin(BatchKind::Ingest);
        tx.extend_read_set(read_set);
        for note in notes {
            tx.put_note(note);
        }
        for edge in edges {
            tx.add_edge(edge);
        }
        self.commit_tx(tx)
    }

    /// The single write path: version check, validate, persist, apply.
    pub fn commit_tx(&self, tx: Transaction) -> Result<CommitReceipt> {
        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut stale: Vec<NoteId> = tx
            .read_set()
            .iter()
            .filter(|(id, version)| current.version(id) != Some(**version))
            .map(|(id, _)| id.clone())
            .collect();
        stale.extend(
            tx.staged_notes()
                .filter(|n| !tx.read_set().contains_key(&n.id) && current.contains(&n.id))
                .map(|n| n.id.clone()),
        );
        if !stale.is_empty() {
            stale.sort();
            stale.dedup();
            debug!(kind = tx.kind().as_str(), ids = ?stale, "write conflict");
            return Err(EngineError::WriteConflict { ids: stale });
        }

        let mut next = (*current).clone();
        let mut touched: BTreeSet<NoteId> = BTreeSet::new();
        let mut receipt = CommitReceipt::default();

        for staged in tx.staged_notes() {
            if staged.id.is_empty() {
                return Err(EngineError::InvalidInput("note id must not be empty".into()));
            }
            let mut note = staged.clone();
            note.version = current.version(&note.id).unwrap_or(0);
            if current.get(&note.id) == Some(&note) {
                continue;
            }
            touched.insert(note.id.clone());
            next.insert_note(note);
        }

        let mut removed_keys: Vec<EdgeKey> = Vec::new();
        for key in tx.removed_edges() {
            if next.remove_edge(key).is_some() {
                touched.insert(key.from.clone());
                touched.insert(key.to.clone());
                removed_keys.push(key.clone());
            }
        }

        let mut added_keys: Vec<EdgeKey> = Vec::new();
        for edge in tx.staged_edges() {
            validate_edge(&next, edge)?;
            if next.insert_edge(edge.clone()) {
                touched.insert(edge.from.clone());
                touched.insert(edge.to.clone());
                added_keys.push(edge.key());
            }
        }

        // Notes that lost a connection: neighbours of anything that left the
        // active set, plus endpoints already in `touched`.
        let mut candidates = touched.clone();
        for id in &touched {
            let was_active = current.is_active(id);
            if was_active && !next.is_active(id) {
                for edge in current.incident(id).chain(next.incident(id)) {
                    candidates.insert(edge.key().other(id).clone());
                }
            }
        }
        for id in &candidates {
            let Some(note) = next.get(id) else { continue };
            let orphaned = note.is_active() && !note.is_root && !next.has_active_connection(id);
            if note.needs_relink != orphaned {
                if let Some(note) = next.note_mut(id) {
                    note.needs_relink = orphaned;
                }
                touched.insert(id.clone());
                if orphaned {
                    receipt.flagged_for_relink.push(id.clone());
                }
            }
        }

        if touched.is_empty() {
            return Ok(receipt);
        }

        for id in &touched {
            validate_note(&next, id)?;
            let version = current.version(id).unwrap_or(0) + 1;
            if let Some(note) = next.note_mut(id) {
                note.version = version;
            }
            receipt.versions.insert(id.clone(), version);
        }

        let mut batch = WriteBatch::new(tx.kind());
        batch.put_notes = touched.iter().filter_map(|id| next.get(id).cloned()).collect();
        batch.put_edges = added_keys
            .iter()
            .filter_map(|key| next.edge(key).cloned())
            .collect();
        batch.delete_edges = removed_keys;
        receipt.edges_added = batch.put_edges.len();
        receipt.edges_removed = batch.delete_edges.len();

        self.persistence.apply(&batch)?;

        {
            let mut guard = self.graph.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::new(next);
        }
        debug!(
            kind = tx.kind().as_str(),
            notes = batch.put_notes.len(),
            edges_added = receipt.edges_added,
            edges_removed = receipt.edges_removed,
            "commit applied"
        );
        Ok(receipt)
    }

    /// Lazy decay, reinforcement and review push-back for one note, then an
    /// access event for the next consolidation report.
    pub fn record_access(&self, id: &NoteId, now: DateTime<Utc>) -> Result<AtomicNote> {
        let mut attempts = 0;
        let note = loop {
            let mut tx = self.begin(BatchKind::Access);
            let note = tx.note(id).ok_or_else(|| EngineError::NotFound(id.clone()))?;
            if !note.is_active() {
                return Err(EngineError::InvalidInput(format!(
                    "note {id} is {}; only active notes are reinforced",
                    note.status
                )));
            }
            tx.update_note(id, |n| self.policy.reinforce(n, now))?;
            match self.commit_tx(tx) {
                Ok(_) => break self.get_note(id).ok_or_else(|| EngineError::NotFound(id.clone()))?,
                Err(e @ EngineError::WriteConflict { .. }) => {
                    attempts += 1;
                    if attempts > self.config.max_commit_retries {
                        return Err(e);
                    }
                    debug!(%id, attempts, "retrying access after conflict");
                }
                Err(e) => return Err(e),
            }
        };
        self.push_access_event(id.clone());
        Ok(note)
    }

    /// Record an access that was applied inside another transaction.
    pub(crate) fn push_access_event(&self, id: NoteId) {
        self.access_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
    }

    /// Access events recorded since the last drain, in arrival order.
    pub fn drain_access_events(&self) -> Vec<NoteId> {
        std::mem::take(&mut *self.access_events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn mark_archived(&self, id: &NoteId) -> Result<CommitReceipt> {
        let mut tx = self.begin(BatchKind::Archive);
        tx.archive(id)?;
        self.commit_tx(tx)
    }

    /// Move every non-`derived_from` edge of `old` onto `new`.
    pub fn rewire_edges(&self, old: &NoteId, new: &NoteId) -> Result<usize> {
        let mut tx = self.begin(BatchKind::Rewire);
        if !tx.base().contains(old) {
            return Err(EngineError::NotFound(old.clone()));
        }
        if !tx.base().is_active(new) {
            return Err(EngineError::InvalidInput(format!(
                "rewire target {new} is missing or not active"
            )));
        }
        let moved = tx.rewire(old, new, &BTreeSet::new());
        self.commit_tx(tx)?;
        Ok(moved)
    }

    /// Every note a summary was built from, transitively, archived included.
    pub fn provenance(&self, id: &NoteId) -> Result<Vec<AtomicNote>> {
        let graph = self.snapshot();
        if !graph.contains(id) {
            return Err(EngineError::NotFound(id.clone()));
        }
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.clone()];
        let mut members = Vec::new();
        while let Some(current) = stack.pop() {
            let mut children = graph.derived_members(&current);
            children.sort();
            for child in children.into_iter().rev() {
                if seen.insert(child.clone()) {
                    if let Some(note) = graph.get(&child) {
                        members.push(note.clone());
                    }
                    stack.push(child);
                }
            }
        }
        Ok(members)
    }

    pub fn due_for_review(&self, now: DateTime<Utc>, limit: usize) -> Vec<NoteId> {
        self.snapshot().due(now, limit)
    }

    pub fn verify(&self) -> Result<()> {
        self.snapshot().verify()
    }
}

/// Mark a note failed and clamp the value that made it so, keeping the
/// record storable.
pub(crate) fn quarantine(note: &mut AtomicNote) {
    note.status = NoteStatus::Failed;
    note.relevance = if note.relevance.is_finite() {
        note.relevance.clamp(0.0, 1.0)
    } else {
        0.0
    };
    note.needs_relink = false;
}

fn validate_edge(graph: &Graph, edge: &Edge) -> Result<()> {
    let ids = || vec![edge.from.clone(), edge.to.clone()];
    if edge.from == edge.to {
        return Err(EngineError::corruption("self-loop edge", ids()));
    }
    let missing: Vec<NoteId> = [&edge.from, &edge.to]
        .into_iter()
        .filter(|id| !graph.contains(id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::corruption("edge endpoint does not exist", missing));
    }
    if !edge.weight.is_finite() || edge.weight < 0.0 {
        return Err(EngineError::corruption(
            format!("edge weight {} is not a finite non-negative number", edge.weight),
            ids(),
        ));
    }
    let (Some(from), Some(to)) = (graph.get(&edge.from), graph.get(&edge.to)) else {
        return Err(EngineError::corruption("edge endpoint does not exist", ids()));
    };
    if from.status == NoteStatus::Failed || to.status == NoteStatus::Failed {
        return Err(EngineError::corruption("edge touches a failed note", ids()));
    }
    if edge.relation == Relation::DerivedFrom {
        if from.layer <= to.layer {
            return Err(EngineError::corruption(
                "derived_from must point to a lower layer",
                ids(),
            ));
        }
    } else if from.status == NoteStatus::Archived || to.status == NoteStatus::Archived {
        return Err(EngineError::corruption(
            format!("{} edge touches an archived note", edge.relation),
            ids(),
        ));
    }
    Ok(())
}

fn validate_note(graph: &Graph, id: &NoteId) -> Result<()> {
    let Some(note) = graph.get(id) else {
        return Ok(());
    };
    if note.status != NoteStatus::Failed && RelevancePolicy::is_corrupt(note) {
        return Err(EngineError::corruption(
            format!("relevance {} outside [0, 1]", note.relevance),
            vec![id.clone()],
        ));
    }
    for edge in graph.incident(id).filter(|e| e.relation == Relation::DerivedFrom) {
        let layers = graph.get(&edge.from).zip(graph.get(&edge.to));
        if layers.is_some_and(|(from, to)| from.layer <= to.layer) {
            return Err(EngineError::corruption(
                "derived_from must point to a lower layer",
                vec![edge.from.clone(), edge.to.clone()],
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsolidationConfig;
    use crate::error::PersistenceError;
    use crate::graph::persistence::PersistedGraph;

    fn store() -> GraphStore {
        GraphStore::in_memory(
            GraphConfig::default(),
            RelevancePolicy::from_config(&ConsolidationConfig::default()),
        )
        .unwrap()
    }

    fn edge(from: &AtomicNote, to: &AtomicNote, relation: Relation, weight: f64) -> Edge {
        Edge::new(from.id.clone(), to.id.clone(), relation, weight, Utc::now())
    }

    /// Accepts loads, refuses every write.
    struct ReadOnlyBackend;

    impl Persistence for ReadOnlyBackend {
        fn load(&self) -> std::result::Result<PersistedGraph, PersistenceError> {
            Ok(PersistedGraph::default())
        }

        fn apply(&self, _batch: &WriteBatch) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::CorruptRecord {
                key: "batch".into(),
                reason: "read-only backend".into(),
            })
        }
    }

    #[test]
    fn commit_assigns_versions_and_clears_relink() {
        let store = store();
        let now = Utc::now();
        let a = AtomicNote::new("Paris is the capital of France", now);
        store.commit(a.clone(), vec![]).unwrap();
        let stored = store.get_note(&a.id).unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.needs_relink);

        let b = AtomicNote::new("The Eiffel Tower is in Paris", now);
        let receipt = store
            .commit(b.clone(), vec![edge(&b, &a, Relation::Elaborates, 0.33)])
            .unwrap();
        assert_eq!(receipt.edges_added, 1);
        let a_after = store.get_note(&a.id).unwrap();
        assert_eq!(a_after.version, 2);
        assert!(!a_after.needs_relink);
        assert!(!store.get_note(&b.id).unwrap().needs_relink);
    }

    #[test]
    fn dangling_endpoint_is_corruption_and_nothing_applies() {
        let store = store();
        let now = Utc::now();
        let a = AtomicNote::new("a claim", now);
        let ghost = AtomicNote::new("never committed", now);
        let err = store
            .commit(a.clone(), vec![edge(&a, &ghost, Relation::Supports, 0.9)])
            .unwrap_err();
        match err {
            EngineError::GraphCorruption { ids, .. } => assert_eq!(ids, vec![ghost.id.clone()]),
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(store.get_note(&a.id).is_none());
        assert_eq!(store.snapshot().edge_count(), 0);
    }

    #[test]
    fn re_adding_triple_keeps_max_weight() {
        let store = store();
        let now = Utc::now();
        let a = AtomicNote::new("a claim", now);
        let b = AtomicNote::new("b claim", now);
        store
            .commit_batch(vec![a.clone(), b.clone()], vec![edge(&a, &b, Relation::Supports, 0.7)], &ReadSet::new())
            .unwrap();
        store
            .commit_batch(vec![], vec![edge(&a, &b, Relation::Supports, 0.4)], &ReadSet::new())
            .unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.edge_count(), 1);
        assert_eq!(snapshot.outgoing(&a.id).next().unwrap().weight, 0.7);
    }

    #[test]
    fn stale_read_set_conflicts() {
        let store = store();
        let now = Utc::now();
        let x = AtomicNote::new("shared neighbour", now);
        store.commit(x.clone(), vec![]).unwrap();

        let base = store.snapshot();
        let a = AtomicNote::new("first", now);
        let b = AtomicNote::new("second", now);
        let mut tx_a = Transaction::new(BatchKind::Ingest, Arc::clone(&base));
        tx_a.put_note(a.clone());
        tx_a.add_edge(edge(&a, &x, Relation::Elaborates, 0.5));
        let mut tx_b = Transaction::new(BatchKind::Ingest, base);
        tx_b.put_note(b.clone());
        tx_b.add_edge(edge(&b, &x, Relation::Elaborates, 0.5));

        store.commit_tx(tx_a).unwrap();
        let err = store.commit_tx(tx_b).unwrap_err();
        assert!(matches!(err, EngineError::WriteConflict { ref ids } if ids == &vec![x.id.clone()]));
        assert!(store.get_note(&b.id).is_none());
    }

    #[test]
    fn failed_persistence_leaves_memory_untouched() {
        let store = GraphStore::open(
            Arc::new(ReadOnlyBackend),
            GraphConfig::default(),
            RelevancePolicy::from_config(&ConsolidationConfig::default()),
        )
        .unwrap();
        let note = AtomicNote::new("unsaved", Utc::now());
        assert!(matches!(
            store.commit(note.clone(), vec![]),
            Err(EngineError::Persistence(_))
        ));
        assert!(store.get_note(&note.id).is_none());
    }

    #[test]
    fn archiving_flags_neighbour_left_without_connection() {
        let store = store();
        let now = Utc::now();
        let a = AtomicNote::new("a claim", now);
        let b = AtomicNote::new("b claim", now);
        store
            .commit_batch(vec![a.clone(), b.clone()], vec![edge(&a, &b, Relation::Supports, 0.8)], &ReadSet::new())
            .unwrap();

        let receipt = store.mark_archived(&a.id).unwrap();
        assert_eq!(receipt.flagged_for_relink, vec![b.id.clone()]);
        assert!(store.get_note(&b.id).unwrap().needs_relink);
        assert_eq!(store.get_note(&a.id).unwrap().status, NoteStatus::Archived);
    }

    #[test]
    fn non_derived_edge_to_archived_note_is_rejected() {
        let store = store();
        let now = Utc::now();
        let a = AtomicNote::new("a claim", now);
        store.commit(a.clone(), vec![]).unwrap();
        store.mark_archived(&a.id).unwrap();

        let b = AtomicNote::new("b claim", now);
        let err = store
            .commit(b.clone(), vec![edge(&b, &a, Relation::Supports, 0.9)])
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphCorruption { .. }));
    }

    #[test]
    fn derived_from_must_point_down() {
        let store = store();
        let now = Utc::now();
        let low = AtomicNote::new("low", now);
        let high = AtomicNote::new("high", now).with_layer(1);
        let err = store
            .commit_batch(
                vec![low.clone(), high.clone()],
                vec![edge(&low, &high, Relation::DerivedFrom, 1.0)],
                &ReadSet::new(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphCorruption { .. }));
    }

    #[test]
    fn relevance_out_of_range_is_rejected() {
        let store = store();
        let note = AtomicNote::new("too relevant", Utc::now()).with_relevance(1.2);
        assert!(matches!(
            store.commit(note, vec![]),
            Err(EngineError::GraphCorruption { .. })
        ));
    }

    #[test]
    fn upsert_requires_current_version() {
        let store = store();
        let note = AtomicNote::new("draft", Utc::now());
        let id = store.upsert_note(note).unwrap();

        let mut current = store.get_note(&id).unwrap();
        current.content = "revised".into();
        let mut stale = current.clone();
        stale.version = 0;

        assert!(matches!(
            store.upsert_note(stale),
            Err(EngineError::WriteConflict { .. })
        ));
        store.upsert_note(current).unwrap();
        assert_eq!(store.get_note(&id).unwrap().content, "revised");
    }

    #[test]
    fn unchanged_commit_is_noop() {
        let store = store();
        let note = AtomicNote::new("steady", Utc::now());
        store.commit(note.clone(), vec![]).unwrap();
        let same = store.get_note(&note.id).unwrap();
        let mut tx = store.begin(BatchKind::Update);
        tx.put_note(same);
        assert!(store.commit_tx(tx).unwrap().is_noop());
        assert_eq!(store.get_note(&note.id).unwrap().version, 1);
    }

    #[test]
    fn record_access_reinforces_and_logs_event() {
        let store = store();
        let start = Utc::now();
        let note = AtomicNote::new("remember me", start).with_relevance(0.4);
        store.commit(note.clone(), vec![]).unwrap();

        let accessed = store.record_access(&note.id, start + chrono::Duration::hours(1)).unwrap();
        assert!(accessed.relevance > 0.4);
        assert_eq!(store.drain_access_events(), vec![note.id.clone()]);
        assert!(store.drain_access_events().is_empty());
    }

    #[test]
    fn quarantines_corrupt_notes_on_open() {
        let backend = Arc::new(MemoryPersistence::new());
        let bad = AtomicNote::new("bad", Utc::now()).with_relevance(f64::NAN);
        let mut batch = WriteBatch::new(BatchKind::Ingest);
        batch.put_notes.push(bad.clone());
        backend.apply(&batch).unwrap();

        let store = GraphStore::open(
            backend,
            GraphConfig::default(),
            RelevancePolicy::from_config(&ConsolidationConfig::default()),
        )
        .unwrap();
        let loaded = store.get_note(&bad.id).unwrap();
        assert_eq!(loaded.status, NoteStatus::Failed);
        assert_eq!(loaded.relevance, 0.0);
    }

    #[test]
    fn provenance_walks_nested_summaries() {
        let store = store();
        let now = Utc::now();
        let m1 = AtomicNote::new("member one", now);
        let m2 = AtomicNote::new("member two", now);
        let mid = AtomicNote::new("mid summary", now).with_layer(1);
        let top = AtomicNote::new("top summary", now).with_layer(2);
        store
            .commit_batch(
                vec![m1.clone(), m2.clone(), mid.clone(), top.clone()],
                vec![
                    edge(&mid, &m1, Relation::DerivedFrom, 1.0),
                    edge(&mid, &m2, Relation::DerivedFrom, 1.0),
                    edge(&top, &mid, Relation::DerivedFrom, 1.0),
                ],
                &ReadSet::new(),
            )
            .unwrap();

        let ids: BTreeSet<NoteId> = store
            .provenance(&top.id)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, [m1.id, m2.id, mid.id].into_iter().collect());
    }

    #[test]
    fn commit_shares_untouched_notes_with_the_previous_snapshot() {
        let store = store();
        let now = Utc::now();
        let notes: Vec<AtomicNote> = (0..300)
            .map(|i| {
                let mut note = AtomicNote::new(format!("reef survey {i}"), now);
                note.embedding = Some(vec![i as f32; 384]);
                note
            })
            .collect();
        store
            .commit_batch(notes.clone(), vec![], &ReadSet::new())
            .unwrap();
        let before = store.snapshot();

        store
            .record_access(&notes[0].id, now + chrono::Duration::hours(1))
            .unwrap();
        let after = store.snapshot();

        assert!(!std::ptr::eq(
            before.get(&notes[0].id).unwrap(),
            after.get(&notes[0].id).unwrap()
        ));
        let shared = notes[1..]
            .iter()
            .filter(|n| std::ptr::eq(before.get(&n.id).unwrap(), after.get(&n.id).unwrap()))
            .count();
        assert_eq!(shared, notes.len() - 1);
    }
}
