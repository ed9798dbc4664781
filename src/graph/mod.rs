pub mod arena;
pub mod persistence;
pub mod shard;
pub mod sqlite;
pub mod stats;
pub mod store;
pub mod transaction;
pub mod traverse;
pub mod types;

pub use arena::Graph;
pub use persistence::{BatchKind, MemoryPersistence, PersistedGraph, Persistence, WriteBatch};
pub use sqlite::SqlitePersistence;
pub use stats::GraphStats;
pub use store::{CommitReceipt, GraphStore};
pub use transaction::{ReadSet, Transaction};
pub use traverse::{Subgraph, TraversalFilter};
pub use types::{AtomicNote, Edge, EdgeKey, NoteId, NoteStatus, Relation};
