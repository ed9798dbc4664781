use std::collections::{BTreeSet, VecDeque};

use crate::graph::arena::Graph;
use crate::graph::types::{AtomicNote, NoteId, Relation};

/// Connected component containing `seed` over `elaborates`/`supports` edges
/// (either direction), restricted to notes `admit` accepts. The seed is always
/// a member.
pub fn cohesive_component(
    graph: &Graph,
    seed: &NoteId,
    admit: impl Fn(&AtomicNote) -> bool,
) -> BTreeSet<NoteId> {
    let mut members = BTreeSet::from([seed.clone()]);
    let mut queue = VecDeque::from([seed.clone()]);
    while let Some(id) = queue.pop_front() {
        for edge in graph.incident(&id).filter(|e| e.relation.is_cohesive()) {
            let other = edge.key().other(&id).clone();
            if members.contains(&other) {
                continue;
            }
            if graph.get(&other).is_some_and(&admit) {
                members.insert(other.clone());
                queue.push_back(other);
            }
        }
    }
    members
}

/// A `contradicts` edge joins two members.
pub fn has_internal_contradiction(graph: &Graph, members: &BTreeSet<NoteId>) -> bool {
    members.iter().any(|id| {
        graph
            .outgoing(id)
            .any(|e| e.relation == Relation::Contradicts && members.contains(&e.to))
    })
}
