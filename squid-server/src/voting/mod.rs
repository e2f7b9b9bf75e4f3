//! Live vote sessions: persistence, registry, event routing and effects.
//!
//! Architecture:
//! - **Repository** (`repository`): store for sessions, ballots and tracked
//!   messages; the source of truth across restarts
//! - **Registry** (`registry`): message id to live session index
//! - **Engine** (`engine`): creates sessions and routes reaction events into
//!   them under a per-session lock
//! - **Interpreter** (`interpreter`): executes the effects sessions produce

pub mod collaborators;
pub mod engine;
pub mod interpreter;
pub mod registry;
pub mod repository;

#[cfg(test)]
pub(crate) mod test_support;

pub use collaborators::{
    BuildCatalogue, Collaborators, MessagingSurface, PermissionGate, WeightProvider,
};
pub use engine::{
    EngineError, IgnoreReason, NewBuildChangeSession, NewDeleteLogSession, ReactionEvent,
    ReactionOutcome, RejectReason, VoteEngine,
};
pub use registry::{SharedSession, VoteSessionRegistry};
pub use repository::{InMemoryRepository, RepositoryError, SqliteRepository, VoteRepository};
