use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{call_with_retry, Embedder, RetryPolicy};
use crate::config::LinkerConfig;
use crate::graph::arena::Graph;
use crate::graph::transaction::ReadSet;
use crate::graph::types::{AtomicNote, Edge, NoteId, NoteStatus, Relation};
use crate::text;

/// What the Linker needs to know about a note, staged or committed.
#[derive(Debug, Clone)]
pub struct LinkSubject {
    pub id: NoteId,
    pub content: String,
    pub terms: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    pub layer: u32,
}

impl LinkSubject {
    pub fn from_note(note: &AtomicNote) -> Self {
        Self {
            id: note.id.clone(),
            content: note.content.clone(),
            terms: text::terms(&note.content),
            embedding: note.embedding.clone(),
            layer: note.layer,
        }
    }
}

/// Proposed outgoing edges for one subject, plus the versions of the existing
/// notes they touch.
#[derive(Debug, Clone, Default)]
pub struct LinkProposal {
    pub edges: Vec<Edge>,
    pub read_set: ReadSet,
    /// Similarity search failed; only structural links were considered.
    pub semantic_degraded: bool,
}

/// Relation implied by lexical cues in the newer claim.
pub fn classify(content: &str) -> Relation {
    if text::has_contradiction_marker(content) {
        Relation::Contradicts
    } else if text::has_temporal_marker(content) {
        Relation::TemporalFollows
    } else {
        Relation::Elaborates
    }
}

pub struct Linker {
    embedder: Arc<dyn Embedder>,
    config: LinkerConfig,
    retry: RetryPolicy,
}

impl Linker {
    pub fn new(embedder: Arc<dyn Embedder>, config: LinkerConfig, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            config,
            retry,
        }
    }

    /// Edges from `subject` to committed notes in `graph` and to `peers`
    /// (notes staged earlier in the same document).
    pub async fn propose(
        &self,
        subject: &LinkSubject,
        peers: &[LinkSubject],
        graph: &Graph,
        now: DateTime<Utc>,
    ) -> LinkProposal {
        let structural = self.structural_matches(subject, peers, graph);
        let (semantic, semantic_degraded) = self.semantic_matches(subject, peers).await;

        let relation = classify(&subject.content);
        let mut candidates: Vec<(NoteId, Relation, f64)> = Vec::new();
        for (id, score) in &structural {
            let weight = semantic.get(id).map_or(*score, |s| s.max(*score));
            candidates.push((id.clone(), relation, weight));
        }
        for (id, similarity) in &semantic {
            if !structural.contains_key(id) {
                candidates.push((id.clone(), Relation::Supports, *similarity));
            }
        }

        let peer_ids: BTreeSet<&NoteId> = peers.iter().map(|p| &p.id).collect();
        let mut merged: BTreeMap<(NoteId, Relation), f64> = BTreeMap::new();
        for (id, relation, weight) in candidates {
            let target = if peer_ids.contains(&id) {
                Some(id.clone())
            } else {
                resolve_target(graph, &id)
            };
            let Some(target) = target else {
                debug!(candidate = %id, "link target dropped");
                continue;
            };
            if target == subject.id {
                continue;
            }
            merged
                .entry((target, relation))
                .and_modify(|w| *w = w.max(weight))
                .or_insert(weight);
        }

        let mut ranked: Vec<((NoteId, Relation), f64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.config.max_fanout);

        let mut read_set = ReadSet::new();
        let edges = ranked
            .into_iter()
            .map(|((to, relation), weight)| {
                if let Some(version) = graph.version(&to).filter(|_| !peer_ids.contains(&to)) {
                    read_set.insert(to.clone(), version);
                }
                Edge::new(subject.id.clone(), to, relation, weight.clamp(0.0, 1.0), now)
            })
            .collect::<Vec<_>>();

        debug!(subject = %subject.id, edges = edges.len(), "link proposal");
        LinkProposal {
            edges,
            read_set,
            semantic_degraded,
        }
    }

    /// Edges from staged peers to an existing note a duplicate claim restated,
    /// so the existing note joins the new document's context.
    pub fn link_duplicate(
        &self,
        existing: &LinkSubject,
        peers: &[LinkSubject],
        now: DateTime<Utc>,
    ) -> Vec<Edge> {
        let mut edges: Vec<Edge> = peers
            .iter()
            .filter(|peer| peer.id != existing.id)
            .filter_map(|peer| {
                let structural = text::overlap(&peer.terms, &existing.terms);
                let semantic = match (&peer.embedding, &existing.embedding) {
                    (Some(a), Some(b)) => f64::from(self.embedder.similarity(a, b)),
                    _ => 0.0,
                };
                if structural >= self.config.structural_min_overlap {
                    Some(Edge::new(
                        peer.id.clone(),
                        existing.id.clone(),
                        classify(&peer.content),
                        structural.max(semantic).clamp(0.0, 1.0),
                        now,
                    ))
                } else if semantic >= self.config.link_similarity {
                    Some(Edge::new(
                        peer.id.clone(),
                        existing.id.clone(),
                        Relation::Supports,
                        semantic.clamp(0.0, 1.0),
                        now,
                    ))
                } else {
                    None
                }
            })
            .collect();
        edges.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.from.cmp(&b.from)));
        edges.truncate(self.config.max_fanout);
        edges
    }

    fn structural_matches(
        &self,
        subject: &LinkSubject,
        peers: &[LinkSubject],
        graph: &Graph,
    ) -> BTreeMap<NoteId, f64> {
        let threshold = self.config.structural_min_overlap;
        let mut matches = BTreeMap::new();
        for id in graph.notes_sharing_terms(&subject.terms) {
            if id == subject.id {
                continue;
            }
            let Some(terms) = graph.terms_of(&id) else { continue };
            let score = text::overlap(&subject.terms, terms);
            if score >= threshold && score > 0.0 {
                matches.insert(id, score);
            }
        }
        for peer in peers {
            let score = text::overlap(&subject.terms, &peer.terms);
            if peer.id != subject.id && score >= threshold && score > 0.0 {
                matches.insert(peer.id.clone(), score);
            }
        }
        matches
    }

    async fn semantic_matches(
        &self,
        subject: &LinkSubject,
        peers: &[LinkSubject],
    ) -> (BTreeMap<NoteId, f64>, bool) {
        let mut matches = BTreeMap::new();
        let Some(vector) = &subject.embedding else {
            return (matches, false);
        };
        let threshold = self.config.link_similarity;
        let mut degraded = false;

        match call_with_retry(&self.retry, "nearest", || {
            self.embedder
                .nearest(vector, self.config.top_k, Some(subject.layer))
        })
        .await
        {
            Ok(hits) => {
                for (id, similarity) in hits {
                    let similarity = f64::from(similarity);
                    if id != subject.id && similarity >= threshold {
                        matches.insert(id, similarity);
                    }
                }
            }
            Err(e) => {
                warn!(subject = %subject.id, error = %e.last_error, "semantic linking unavailable");
                degraded = true;
            }
        }

        for peer in peers {
            if let Some(other) = &peer.embedding {
                let similarity = f64::from(self.embedder.similarity(vector, other));
                if similarity >= threshold {
                    matches.insert(peer.id.clone(), similarity);
                }
            }
        }
        (matches, degraded)
    }
}

/// Where an edge to `id` should land: the note itself if active, its owning
/// summary if archived, nowhere if failed or unknown.
pub fn resolve_target(graph: &Graph, id: &NoteId) -> Option<NoteId> {
    match graph.get(id)?.status {
        NoteStatus::Active => Some(id.clone()),
        NoteStatus::Archived => graph.owning_summary(id),
        NoteStatus::Failed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::StubEmbedder;

    fn linker(embedder: Arc<StubEmbedder>) -> Linker {
        Linker::new(embedder, LinkerConfig::default(), RetryPolicy::default())
    }

    fn subject(content: &str, embedder: &StubEmbedder) -> LinkSubject {
        let mut note = AtomicNote::new(content, Utc::now());
        note.embedding = Some(embedder.vector_for(content));
        LinkSubject::from_note(&note)
    }

    #[test]
    fn classify_uses_lexical_cues() {
        assert_eq!(classify("Paris is not in Spain"), Relation::Contradicts);
        assert_eq!(classify("Then the tower opened"), Relation::TemporalFollows);
        assert_eq!(classify("The tower is in Paris"), Relation::Elaborates);
        assert_eq!(classify("Exercise can strengthen bones"), Relation::Elaborates);
        assert_eq!(classify("The bilateral treaty covers fishing"), Relation::Elaborates);
        assert_eq!(classify("Penguins cannot fly"), Relation::Elaborates);
    }

    #[tokio::test]
    async fn structural_link_to_staged_peer() {
        let embedder = Arc::new(StubEmbedder::new());
        let linker = linker(embedder.clone());
        let paris = subject("Paris is the capital of France", &embedder);
        let tower = subject("The Eiffel Tower is in Paris", &embedder);

        let proposal = linker
            .propose(&tower, std::slice::from_ref(&paris), &Graph::new(), Utc::now())
            .await;
        assert_eq!(proposal.edges.len(), 1);
        let edge = &proposal.edges[0];
        assert_eq!((&edge.from, &edge.to), (&tower.id, &paris.id));
        assert_eq!(edge.relation, Relation::Elaborates);
        assert!((edge.weight - 1.0 / 3.0).abs() < 1e-6);
        assert!(proposal.read_set.is_empty());
    }

    #[tokio::test]
    async fn semantic_match_yields_supports_with_read_set() {
        let embedder = Arc::new(StubEmbedder::new());
        let existing = AtomicNote::new("Cats sleep most afternoons", Utc::now());
        let shared = vec![1.0, 0.0, 0.0];
        embedder.index(&existing.id, &shared, 0).await.unwrap();
        let graph = Graph::from_parts(vec![existing.clone()], vec![]);

        let mut note = AtomicNote::new("Felines nap a lot", Utc::now());
        note.embedding = Some(vec![0.9, 0.1, 0.0]);
        let proposal = linker(embedder)
            .propose(&LinkSubject::from_note(&note), &[], &graph, Utc::now())
            .await;

        assert_eq!(proposal.edges.len(), 1);
        assert_eq!(proposal.edges[0].relation, Relation::Supports);
        assert_eq!(proposal.read_set.get(&existing.id), Some(&existing.version));
    }

    #[tokio::test]
    async fn archived_target_redirects_to_summary() {
        let now = Utc::now();
        let mut member = AtomicNote::new("Rust ownership rules prevent data races", now);
        member.status = NoteStatus::Archived;
        let summary = AtomicNote::new("- memory safety summary", now).with_layer(1);
        let graph = Graph::from_parts(
            vec![member.clone(), summary.clone()],
            vec![Edge::new(summary.id.clone(), member.id.clone(), Relation::DerivedFrom, 1.0, now)],
        );

        let embedder = Arc::new(StubEmbedder::new());
        let new_note = subject("Rust ownership rules are checked at compile time", &embedder);
        let proposal = linker(embedder).propose(&new_note, &[], &graph, now).await;

        assert_eq!(proposal.edges.len(), 1);
        assert_eq!(proposal.edges[0].to, summary.id);
    }

    #[tokio::test]
    async fn fanout_is_capped_deterministically() {
        let embedder = Arc::new(StubEmbedder::new());
        let config = LinkerConfig {
            max_fanout: 2,
            ..LinkerConfig::default()
        };
        let linker = Linker::new(embedder.clone(), config, RetryPolicy::default());
        let peers: Vec<LinkSubject> = (0..5)
            .map(|i| subject(&format!("Garden tomatoes variety{i}"), &embedder))
            .collect();
        let new_note = subject("Garden tomatoes need sun", &embedder);

        let first = linker.propose(&new_note, &peers, &Graph::new(), Utc::now()).await;
        let second = linker.propose(&new_note, &peers, &Graph::new(), Utc::now()).await;
        assert_eq!(first.edges.len(), 2);
        let targets = |p: &LinkProposal| p.edges.iter().map(|e| e.to.clone()).collect::<Vec<_>>();
        assert_eq!(targets(&first), targets(&second));
    }

    #[test]
    fn duplicate_links_peers_to_existing_note() {
        let embedder = Arc::new(StubEmbedder::new());
        let linker = linker(embedder.clone());
        let existing = subject("Paris is the capital of France", &embedder);
        let peer = subject("The Eiffel Tower is in Paris", &embedder);
        let edges = linker.link_duplicate(&existing, std::slice::from_ref(&peer), Utc::now());
        assert_eq!(edges.len(), 1);
        assert_eq!((&edges[0].from, &edges[0].to), (&peer.id, &existing.id));
    }
}
