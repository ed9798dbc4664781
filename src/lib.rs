//! Active memory for agents: unstructured text becomes a graph of atomic notes
//! that links, decays and consolidates itself.
//!
//! A document is split into self-contained claims, each claim becomes an
//! [`AtomicNote`](graph::AtomicNote), and typed edges connect it to what the
//! graph already holds. Relevance decays with time and is reinforced on access.
//! Notes that fade are archived, or folded into higher-layer summary notes that
//! keep `derived_from` provenance back to their members.
//!
//! | Stage | Component | Writes |
//! |-------|-----------|--------|
//! | Extract, embed, dedup | [`ingest::Atomizer`] | nothing |
//! | Structural + semantic linking | [`ingest::Linker`] | nothing (proposes edges) |
//! | Validate, version-check, persist | [`graph::GraphStore`] | notes, edges |
//! | Decay, prune, summarize, relink | [`consolidation::ConsolidationEngine`] | via the store |
//!
//! # Architecture
//!
//! - **Storage**: an in-memory arena behind a copy-on-write snapshot, persisted
//!   through [`graph::Persistence`] to SQLite (WAL, forward-only migrations) or
//!   kept in process
//! - **Capabilities**: extraction, embedding and summarization are injected
//!   traits; deterministic stubs ship for tests and offline use
//! - **Concurrency**: optimistic, per-note versions; conflicting writes fail with
//!   [`EngineError::WriteConflict`] and are re-planned by the caller
//!
//! # Modules
//!
//! - [`capability`]: Extractor, Embedder, Summarizer and Completion traits, retry, stubs
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`consolidation`]: Relevance decay, pruning, summarization and relinking
//! - [`db`]: SQLite database initialization, schema and migrations
//! - [`engine`]: [`MemoryEngine`], the ingest / query / consolidate surface
//! - [`graph`]: Note and edge types, the arena, transactions, traversal and stats
//! - [`ingest`]: Document atomization and link proposal

pub mod capability;
pub mod clock;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod text;

pub use capability::Capabilities;
pub use config::EngineConfig;
pub use consolidation::{CancelFlag, ConsolidationReport};
pub use engine::{IngestResult, MemoryEngine};
pub use error::{EngineError, Result};
pub use ingest::Document;
