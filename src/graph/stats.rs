//! Graph statistics and the integrity audit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::consolidation::decay::RelevancePolicy;
use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::store::GraphStore;
use crate::graph::types::{NoteId, NoteStatus, Relation};

#[derive(Debug, Serialize)]
pub struct GraphStats {
    pub total_notes: usize,
    pub total_edges: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_layer: BTreeMap<u32, usize>,
    pub edges_by_relation: BTreeMap<String, usize>,
    /// Active, non-root notes with no connection to another active note.
    pub orphans: usize,
    pub needs_relink: usize,
    pub due_for_review: usize,
}

impl Graph {
    pub fn stats(&self, now: DateTime<Utc>) -> GraphStats {
        let mut by_status = BTreeMap::new();
        let mut by_layer = BTreeMap::new();
        let mut orphans = 0;
        let mut needs_relink = 0;
        for note in self.notes() {
            *by_status.entry(note.status.to_string()).or_insert(0) += 1;
            *by_layer.entry(note.layer).or_insert(0) += 1;
            if note.is_active() && !note.is_root && !self.has_active_connection(&note.id) {
                orphans += 1;
            }
            if note.needs_relink {
                needs_relink += 1;
            }
        }
        let mut edges_by_relation = BTreeMap::new();
        for edge in self.edges() {
            *edges_by_relation
                .entry(edge.relation.to_string())
                .or_insert(0) += 1;
        }
        GraphStats {
            total_notes: self.note_count(),
            total_edges: self.edge_count(),
            by_status,
            by_layer,
            edges_by_relation,
            orphans,
            needs_relink,
            due_for_review: self.due_count(now),
        }
    }

    /// Full integrity audit. Returns the first violation found.
    ///
    /// Checks dangling endpoints, self-loops, `derived_from` layering (which
    /// rules out cycles through summaries), relevance range, and that every
    /// unreachable active note is either a root or flagged for relinking.
    pub fn verify(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for edge in self.edges() {
            let key = edge.key();
            if !seen.insert(key.clone()) {
                return Err(EngineError::corruption(
                    "duplicate edge triple",
                    vec![key.from, key.to],
                ));
            }
            let missing: Vec<NoteId> = [&edge.from, &edge.to]
                .into_iter()
                .filter(|id| !self.contains(id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(EngineError::corruption("dangling edge", missing));
            }
            if edge.from == edge.to {
                return Err(EngineError::corruption("self-loop edge", vec![edge.from.clone()]));
            }
            if edge.relation == Relation::DerivedFrom {
                let layers = self.get(&edge.from).zip(self.get(&edge.to));
                if layers.is_some_and(|(from, to)| from.layer <= to.layer) {
                    return Err(EngineError::corruption(
                        "derived_from must point to a lower layer",
                        vec![edge.from.clone(), edge.to.clone()],
                    ));
                }
            }
        }

        for note in self.notes() {
            if note.status != NoteStatus::Failed && RelevancePolicy::is_corrupt(note) {
                return Err(EngineError::corruption(
                    format!("relevance {} outside [0, 1]", note.relevance),
                    vec![note.id.clone()],
                ));
            }
            if note.is_active()
                && !note.is_root
                && !note.needs_relink
                && !self.has_active_connection(&note.id)
            {
                return Err(EngineError::corruption(
                    "active note is unreachable and not flagged for relinking",
                    vec![note.id.clone()],
                ));
            }
        }
        Ok(())
    }
}

impl GraphStore {
    pub fn stats(&self, now: DateTime<Utc>) -> GraphStats {
        self.snapshot().stats(now)
    }
}
