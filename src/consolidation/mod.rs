//! Background maintenance of the graph: relevance decay, pruning of faded
//! notes into summaries or the archive, and relinking of orphans.

pub mod cluster;
pub mod decay;
pub mod engine;

pub use decay::RelevancePolicy;
pub use engine::{CancelFlag, ConsolidationEngine, ConsolidationReport};
