//! In-memory graph: an arena of notes keyed by id plus adjacency, term and
//! review-queue indices. Readers hold an `Arc<Graph>` snapshot; a commit
//! clones the snapshot, which shares every shard it does not write to.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::graph::shard::{ReviewQueue, ShardedMap};
use crate::graph::types::{AtomicNote, Edge, EdgeKey, NoteId, NoteStatus, Relation};
use crate::text;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    notes: ShardedMap<NoteId, AtomicNote>,
    edges: ShardedMap<EdgeKey, Edge>,
    outgoing: ShardedMap<NoteId, BTreeSet<EdgeKey>>,
    incoming: ShardedMap<NoteId, BTreeSet<EdgeKey>>,
    note_terms: ShardedMap<NoteId, BTreeSet<String>>,
    term_index: ShardedMap<String, BTreeSet<NoteId>>,
    review_queue: ReviewQueue,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get(&self, id: &NoteId) -> Option<&AtomicNote> {
        self.notes.get(id)
    }

    pub fn contains(&self, id: &NoteId) -> bool {
        self.notes.contains_key(id)
    }

    pub fn version(&self, id: &NoteId) -> Option<u64> {
        self.notes.get(id).map(|n| n.version)
    }

    pub fn is_active(&self, id: &NoteId) -> bool {
        self.notes.get(id).is_some_and(|n| n.is_active())
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn notes(&self) -> impl Iterator<Item = &AtomicNote> {
        self.notes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key)
    }

    pub fn outgoing(&self, id: &NoteId) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|k| self.edges.get(k))
    }

    pub fn incoming(&self, id: &NoteId) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|k| self.edges.get(k))
    }

    /// Edges in either direction, outgoing first.
    pub fn incident(&self, id: &NoteId) -> impl Iterator<Item = &Edge> {
        self.outgoing(id).chain(self.incoming(id))
    }

    /// Number of distinct active neighbours over non-`derived_from` edges.
    pub fn active_degree(&self, id: &NoteId) -> usize {
        self.incident(id)
            .filter(|e| e.relation != Relation::DerivedFrom)
            .map(|e| e.key().other(id).clone())
            .filter(|other| self.is_active(other))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// `true` if any edge connects `id` to a different active note.
    pub fn has_active_connection(&self, id: &NoteId) -> bool {
        self.incident(id)
            .any(|e| e.key().other(id) != id && self.is_active(e.key().other(id)))
    }

    pub fn terms_of(&self, id: &NoteId) -> Option<&BTreeSet<String>> {
        self.note_terms.get(id)
    }

    /// Notes whose indexed terms intersect `terms`, any status.
    pub fn notes_sharing_terms(&self, terms: &BTreeSet<String>) -> BTreeSet<NoteId> {
        terms
            .iter()
            .filter_map(|t| self.term_index.get(t))
            .flatten()
            .cloned()
            .collect()
    }

    /// Active notes whose review is due at `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<NoteId> {
        self.review_queue.due(now, limit)
    }

    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.review_queue.due_count(now)
    }

    /// Members a summary was derived from (direct `derived_from` targets).
    pub fn derived_members(&self, id: &NoteId) -> Vec<NoteId> {
        self.outgoing(id)
            .filter(|e| e.relation == Relation::DerivedFrom)
            .map(|e| e.to.clone())
            .collect()
    }

    /// The active summary that (transitively) absorbed `id`, if any.
    pub fn owning_summary(&self, id: &NoteId) -> Option<NoteId> {
        let mut current = id.clone();
        let mut seen = BTreeSet::new();
        while seen.insert(current.clone()) {
            let owner = self
                .incoming(&current)
                .filter(|e| e.relation == Relation::DerivedFrom)
                .map(|e| e.from.clone())
                .min()?;
            if self.is_active(&owner) {
                return Some(owner);
            }
            current = owner;
        }
        None
    }

    // ── Mutations (store-internal) ───────────────────────────────────────────

    pub(crate) fn insert_note(&mut self, note: AtomicNote) {
        if let Some(old) = self.notes.get(&note.id) {
            let (queued_at, content_changed) = (old.next_review_at, old.content != note.content);
            self.review_queue.remove(queued_at, &note.id);
            if content_changed {
                self.unindex_terms(&note.id);
            }
        }
        if !self.note_terms.contains_key(&note.id) {
            let terms = text::terms(&note.content);
            for term in &terms {
                self.term_index
                    .get_or_default(term.clone())
                    .insert(note.id.clone());
            }
            self.note_terms.insert(note.id.clone(), terms);
        }
        if note.status == NoteStatus::Active {
            self.review_queue.insert(note.next_review_at, note.id.clone());
        }
        self.notes.insert(note.id.clone(), note);
    }

    fn unindex_terms(&mut self, id: &NoteId) {
        if let Some(terms) = self.note_terms.remove(id) {
            for term in terms {
                if let Some(ids) = self.term_index.get_mut(&term) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.term_index.remove(&term);
                    }
                }
            }
        }
    }

    pub(crate) fn note_mut(&mut self, id: &NoteId) -> Option<&mut AtomicNote> {
        self.notes.get_mut(id)
    }

    /// Insert an edge, keeping the larger weight if the triple already exists.
    /// Returns `false` when nothing changed.
    pub(crate) fn insert_edge(&mut self, edge: Edge) -> bool {
        let key = edge.key();
        if let Some(existing) = self.edges.get(&key) {
            if edge.weight <= existing.weight {
                return false;
            }
            if let Some(existing) = self.edges.get_mut(&key) {
                existing.weight = edge.weight;
            }
            return true;
        }
        self.outgoing
            .get_or_default(edge.from.clone())
            .insert(key.clone());
        self.incoming
            .get_or_default(edge.to.clone())
            .insert(key.clone());
        self.edges.insert(key, edge);
        true
    }

    pub(crate) fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        if let Some(out) = self.outgoing.get_mut(&key.from) {
            out.remove(key);
        }
        if let Some(inc) = self.incoming.get_mut(&key.to) {
            inc.remove(key);
        }
        Some(edge)
    }

    /// Rebuild a graph from persisted records. Edges are inserted verbatim;
    /// callers run [`Graph::verify`] afterwards.
    pub(crate) fn from_parts(notes: Vec<AtomicNote>, edges: Vec<Edge>) -> Self {
        let mut graph = Self::new();
        for note in notes {
            graph.insert_note(note);
        }
        for edge in edges {
            graph.insert_edge(edge);
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(content: &str) -> AtomicNote {
        AtomicNote::new(content, Utc::now())
    }

    #[test]
    fn term_index_tracks_content() {
        let mut g = Graph::new();
        let paris = note("Paris is the capital of France");
        let tower = note("The Eiffel Tower is in Paris");
        g.insert_note(paris.clone());
        g.insert_note(tower.clone());

        let query = text::terms("Paris museums");
        let hits = g.notes_sharing_terms(&query);
        assert!(hits.contains(&paris.id));
        assert!(hits.contains(&tower.id));

        let mut edited = paris.clone();
        edited.content = "Lyon is a city in France".into();
        g.insert_note(edited);
        assert!(!g.notes_sharing_terms(&query).contains(&paris.id));
    }

    #[test]
    fn insert_edge_dedups_triple_keeping_max_weight() {
        let mut g = Graph::new();
        let a = note("alpha claim");
        let b = note("beta claim");
        g.insert_note(a.clone());
        g.insert_note(b.clone());
        let now = Utc::now();

        assert!(g.insert_edge(Edge::new(a.id.clone(), b.id.clone(), Relation::Supports, 0.4, now)));
        assert!(!g.insert_edge(Edge::new(a.id.clone(), b.id.clone(), Relation::Supports, 0.2, now)));
        assert!(g.insert_edge(Edge::new(a.id.clone(), b.id.clone(), Relation::Supports, 0.9, now)));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.outgoing(&a.id).next().unwrap().weight, 0.9);
        assert_eq!(g.active_degree(&b.id), 1);
    }

    #[test]
    fn review_queue_orders_by_due_time() {
        let mut g = Graph::new();
        let now = Utc::now();
        let mut early = note("early");
        early.next_review_at = now - chrono::Duration::hours(2);
        let mut late = note("late");
        late.next_review_at = now - chrono::Duration::hours(1);
        let mut future = note("future");
        future.next_review_at = now + chrono::Duration::hours(1);
        g.insert_note(late.clone());
        g.insert_note(future);
        g.insert_note(early.clone());

        assert_eq!(g.due(now, 10), vec![early.id.clone(), late.id]);
        assert_eq!(g.due(now, 1), vec![early.id]);
        assert_eq!(g.due_count(now), 2);
    }

    #[test]
    fn owning_summary_follows_archived_chain() {
        let mut g = Graph::new();
        let now = Utc::now();
        let mut member = note("member");
        member.status = NoteStatus::Archived;
        let mut mid = note("mid summary").with_layer(1);
        mid.status = NoteStatus::Archived;
        let top = note("top summary").with_layer(2);
        g.insert_note(member.clone());
        g.insert_note(mid.clone());
        g.insert_note(top.clone());
        g.insert_edge(Edge::new(mid.id.clone(), member.id.clone(), Relation::DerivedFrom, 1.0, now));
        g.insert_edge(Edge::new(top.id.clone(), mid.id.clone(), Relation::DerivedFrom, 1.0, now));

        assert_eq!(g.owning_summary(&member.id), Some(top.id.clone()));
        assert_eq!(g.owning_summary(&top.id), None);
        assert_eq!(g.derived_members(&top.id), vec![mid.id]);
    }
}
