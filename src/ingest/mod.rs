//! Document ingestion: the [`Atomizer`] turns text into candidate notes and
//! the [`Linker`] proposes their edges against a graph snapshot. Chat exports
//! enter through [`Conversation::to_document`].

pub mod atomizer;
pub mod conversation;
pub mod linker;

pub use atomizer::{AtomizedDocument, Atomizer, Candidate, Document, DuplicateRef, RejectedClaim};
pub use conversation::{load_conversations, Conversation, Message};
pub use linker::{classify, LinkProposal, LinkSubject, Linker};
