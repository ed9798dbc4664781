//! Staged mutations built against a snapshot and committed through
//! [`GraphStore::commit_tx`](crate::graph::store::GraphStore::commit_tx).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::persistence::BatchKind;
use crate::graph::types::{AtomicNote, Edge, EdgeKey, NoteId, NoteStatus, Relation};

/// Versions of existing notes a change was planned against.
pub type ReadSet = BTreeMap<NoteId, u64>;

#[derive(Debug, Clone)]
pub struct Transaction {
    kind: BatchKind,
    base: Arc<Graph>,
    read_set: ReadSet,
    notes: BTreeMap<NoteId, AtomicNote>,
    add_edges: BTreeMap<EdgeKey, Edge>,
    remove_edges: BTreeSet<EdgeKey>,
}

impl Transaction {
    pub fn new(kind: BatchKind, base: Arc<Graph>) -> Self {
        Self {
            kind,
            base,
            read_set: ReadSet::new(),
            notes: BTreeMap::new(),
            add_edges: BTreeMap::new(),
            remove_edges: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// The snapshot this transaction was planned against.
    pub fn base(&self) -> &Graph {
        &self.base
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.add_edges.is_empty() && self.remove_edges.is_empty()
    }

    pub(crate) fn staged_notes(&self) -> impl Iterator<Item = &AtomicNote> {
        self.notes.values()
    }

    pub(crate) fn staged_edges(&self) -> impl Iterator<Item = &Edge> {
        self.add_edges.values()
    }

    pub(crate) fn removed_edges(&self) -> impl Iterator<Item = &EdgeKey> {
        self.remove_edges.iter()
    }

    /// Require `id` to still be at `version` when the transaction commits.
    pub fn expect_version(&mut self, id: NoteId, version: u64) {
        self.read_set.insert(id, version);
    }

    /// Merge an externally collected read set. Existing entries win.
    pub fn extend_read_set(&mut self, reads: &ReadSet) {
        for (id, version) in reads {
            self.read_set.entry(id.clone()).or_insert(*version);
        }
    }

    fn observe(&mut self, id: &NoteId) {
        if let Some(version) = self.base.version(id) {
            self.read_set.entry(id.clone()).or_insert(version);
        }
    }

    /// The note as this transaction sees it: staged copy first, then snapshot.
    pub fn note(&self, id: &NoteId) -> Option<&AtomicNote> {
        self.notes.get(id).or_else(|| self.base.get(id))
    }

    pub fn put_note(&mut self, note: AtomicNote) {
        self.observe(&note.id);
        self.notes.insert(note.id.clone(), note);
    }

    pub fn update_note(&mut self, id: &NoteId, f: impl FnOnce(&mut AtomicNote)) -> Result<()> {
        let mut note = self
            .note(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        f(&mut note);
        self.put_note(note);
        Ok(())
    }

    pub fn archive(&mut self, id: &NoteId) -> Result<()> {
        self.update_note(id, |n| n.status = NoteStatus::Archived)
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.observe(&edge.from);
        self.observe(&edge.to);
        let key = edge.key();
        self.remove_edges.remove(&key);
        match self.add_edges.get_mut(&key) {
            Some(existing) => existing.weight = existing.weight.max(edge.weight),
            None => {
                self.add_edges.insert(key, edge);
            }
        }
    }

    pub fn remove_edge(&mut self, key: EdgeKey) {
        self.observe(&key.from);
        self.observe(&key.to);
        self.add_edges.remove(&key);
        self.remove_edges.insert(key);
    }

    /// Incident edges as this transaction sees them.
    pub fn incident_edges(&self, id: &NoteId) -> Vec<Edge> {
        let mut edges: BTreeMap<EdgeKey, Edge> = self
            .base
            .incident(id)
            .filter(|e| !self.remove_edges.contains(&e.key()))
            .map(|e| (e.key(), e.clone()))
            .collect();
        for (key, edge) in &self.add_edges {
            if &key.from == id || &key.to == id {
                edges
                    .entry(key.clone())
                    .and_modify(|e| e.weight = e.weight.max(edge.weight))
                    .or_insert_with(|| edge.clone());
            }
        }
        edges.into_values().collect()
    }

    /// Move every non-`derived_from` edge of `old` onto `new`. Edges to notes
    /// in `keep` or to inactive notes stay where they are; edges between `old`
    /// and `new` are dropped. Returns how many edges were moved.
    pub fn rewire(&mut self, old: &NoteId, new: &NoteId, keep: &BTreeSet<NoteId>) -> usize {
        let mut moved = 0;
        for edge in self.incident_edges(old) {
            if edge.relation == Relation::DerivedFrom {
                continue;
            }
            let key = edge.key();
            let other = key.other(old).clone();
            let other_active = self.note(&other).is_some_and(|n| n.is_active());
            if keep.contains(&other) || (&other != new && !other_active) {
                continue;
            }
            self.remove_edge(key);
            if &other == new {
                continue;
            }
            let (from, to) = if &edge.from == old {
                (new.clone(), other)
            } else {
                (other, new.clone())
            };
            self.add_edge(Edge::new(from, to, edge.relation, edge.weight, edge.created_at));
            moved += 1;
        }
        moved
    }
}
