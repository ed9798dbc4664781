#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use notegraph::capability::{BulletSummarizer, Capabilities, StubEmbedder, StubExtractor};
use notegraph::clock::ManualClock;
use notegraph::config::EngineConfig;
use notegraph::consolidation::RelevancePolicy;
use notegraph::graph::{AtomicNote, Edge, GraphStore, NoteId, Persistence, ReadSet, Relation};
use notegraph::MemoryEngine;
use std::sync::Arc;

/// In-memory backend, millisecond backoffs.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.backend = "memory".into();
    config.atomizer.initial_backoff_ms = 1;
    config.atomizer.max_backoff_ms = 2;
    config.atomizer.call_timeout_ms = 1_000;
    config
}

pub fn test_store() -> Arc<GraphStore> {
    let config = test_config();
    Arc::new(
        GraphStore::in_memory(
            config.graph.clone(),
            RelevancePolicy::from_config(&config.consolidation),
        )
        .unwrap(),
    )
}

pub fn store_on(persistence: Arc<dyn Persistence>) -> GraphStore {
    let config = test_config();
    GraphStore::open(
        persistence,
        config.graph.clone(),
        RelevancePolicy::from_config(&config.consolidation),
    )
    .unwrap()
}

/// Capabilities whose stubs the test keeps handles to.
pub struct Stubs {
    pub extractor: Arc<StubExtractor>,
    pub embedder: Arc<StubEmbedder>,
}

impl Stubs {
    pub fn new() -> Self {
        Self::with_extractor(StubExtractor::new())
    }

    pub fn with_extractor(extractor: StubExtractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
            embedder: Arc::new(StubEmbedder::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            self.extractor.clone(),
            self.embedder.clone(),
            Arc::new(BulletSummarizer::default()),
        )
    }
}

pub struct TestEngine {
    pub engine: MemoryEngine,
    pub clock: Arc<ManualClock>,
    pub stubs: Stubs,
}

impl TestEngine {
    pub fn now(&self) -> DateTime<Utc> {
        use notegraph::clock::Clock;
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        self.engine.store()
    }
}

pub fn test_engine() -> TestEngine {
    engine_with(Stubs::new(), test_config())
}

pub fn engine_with(stubs: Stubs, config: EngineConfig) -> TestEngine {
    let store = Arc::new(
        GraphStore::in_memory(
            config.graph.clone(),
            RelevancePolicy::from_config(&config.consolidation),
        )
        .unwrap(),
    );
    let clock = Arc::new(ManualClock::default());
    let engine = MemoryEngine::new(store, stubs.capabilities(), config, clock.clone());
    TestEngine {
        engine,
        clock,
        stubs,
    }
}

/// A note whose relevance fell under the prune threshold ten days before `now`.
pub fn faded_note(content: &str, now: DateTime<Utc>) -> AtomicNote {
    AtomicNote::new(content, now - Duration::days(10)).with_relevance(0.05)
}

/// A fresh note that will not come up for review for a month.
pub fn settled_note(content: &str, now: DateTime<Utc>) -> AtomicNote {
    let mut note = AtomicNote::new(content, now);
    note.next_review_at = now + Duration::days(30);
    note
}

/// `supports` edges between every pair, lower index pointing at higher.
pub fn supports_mesh(ids: &[NoteId], now: DateTime<Utc>) -> Vec<Edge> {
    let mut edges = Vec::new();
    for (i, from) in ids.iter().enumerate() {
        for to in &ids[i + 1..] {
            edges.push(Edge::new(from.clone(), to.clone(), Relation::Supports, 0.8, now));
        }
    }
    edges
}

pub fn seed(store: &GraphStore, notes: Vec<AtomicNote>, edges: Vec<Edge>) {
    store.commit_batch(notes, edges, &ReadSet::new()).unwrap();
}
