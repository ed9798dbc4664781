//! Bounded breadth-first traversal over a graph snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::graph::arena::Graph;
use crate::graph::store::GraphStore;
use crate::graph::types::{AtomicNote, Edge, EdgeKey, NoteId, NoteStatus, Relation};

/// Which edges and nodes a traversal may cross.
#[derive(Debug, Clone, Default)]
pub struct TraversalFilter {
    /// `None` admits every relation.
    pub relations: Option<BTreeSet<Relation>>,
    pub include_archived: bool,
    pub include_failed: bool,
}

impl TraversalFilter {
    pub fn relations(relations: impl IntoIterator<Item = Relation>) -> Self {
        Self {
            relations: Some(relations.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    fn admits_node(&self, note: &AtomicNote) -> bool {
        match note.status {
            NoteStatus::Active => true,
            NoteStatus::Archived => self.include_archived,
            NoteStatus::Failed => self.include_failed,
        }
    }

    fn admits_edge(&self, edge: &Edge) -> bool {
        self.relations
            .as_ref()
            .map_or(true, |r| r.contains(&edge.relation))
    }
}

/// Nodes reached and the edges among them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<AtomicNote>,
    pub edges: Vec<Edge>,
    /// The node cap cut the traversal short.
    pub truncated: bool,
    /// Seeds whose access could not be recorded; their relevance was not
    /// reinforced by this read.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unrecorded: Vec<NoteId>,
}

impl Subgraph {
    pub fn contains(&self, id: &NoteId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    pub fn node_ids(&self) -> BTreeSet<NoteId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Graph {
    /// Breadth-first in both edge directions, up to `depth` hops from the
    /// seeds and at most `max_nodes` nodes. Unknown seeds are ignored; seeds
    /// the filter rejects are skipped.
    pub fn neighbors(
        &self,
        seeds: &[NoteId],
        depth: usize,
        filter: &TraversalFilter,
        max_nodes: usize,
    ) -> Subgraph {
        let mut visited: BTreeSet<NoteId> = BTreeSet::new();
        let mut nodes = Vec::new();
        let mut edges: BTreeMap<EdgeKey, Edge> = BTreeMap::new();
        let mut frontier: VecDeque<(NoteId, usize)> = VecDeque::new();
        let mut truncated = false;

        for seed in seeds {
            let Some(note) = self.get(seed) else { continue };
            if !filter.admits_node(note) || visited.contains(seed) {
                continue;
            }
            if nodes.len() >= max_nodes {
                truncated = true;
                break;
            }
            visited.insert(seed.clone());
            nodes.push(note.clone());
            frontier.push_back((seed.clone(), 0));
        }

        while let Some((id, level)) = frontier.pop_front() {
            if level >= depth {
                continue;
            }
            let mut incident: Vec<&Edge> =
                self.incident(&id).filter(|e| filter.admits_edge(e)).collect();
            incident.sort_by_key(|e| e.key());

            for edge in incident {
                let other = edge.key().other(&id).clone();
                let Some(note) = self.get(&other) else { continue };
                if !filter.admits_node(note) {
                    continue;
                }
                if !visited.contains(&other) {
                    if nodes.len() >= max_nodes {
                        truncated = true;
                        continue;
                    }
                    visited.insert(other.clone());
                    nodes.push(note.clone());
                    frontier.push_back((other, level + 1));
                }
                edges.insert(edge.key(), edge.clone());
            }
        }

        Subgraph {
            nodes,
            edges: edges.into_values().collect(),
            truncated,
            unrecorded: Vec::new(),
        }
    }
}

impl GraphStore {
    /// Traverse from `seeds` on the current snapshot, capped at the configured
    /// node budget.
    pub fn get_neighbors(
        &self,
        seeds: &[NoteId],
        depth: usize,
        filter: &TraversalFilter,
    ) -> Result<Subgraph> {
        let graph = self.snapshot();
        if let Some(missing) = seeds.iter().find(|id| !graph.contains(id)) {
            return Err(EngineError::NotFound(missing.clone()));
        }
        Ok(graph.neighbors(seeds, depth, filter, self.config().max_traversal_nodes))
    }
}
