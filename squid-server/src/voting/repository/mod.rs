//! Repository abstraction for vote session persistence.
//!
//! The store is the single source of truth: the in-memory registry can be
//! rebuilt from `list_open_sessions` at any time. Implementations provide
//! the backend (in-memory for tests, SQLite in production).

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use squid_core::{MessageId, SessionId, SessionStatus, UserId, VoteSession};
use thiserror::Error;

/// Errors from a persistence backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {what} in storage")]
    Corruption { what: String },
    #[error("vote session {0} not found")]
    NotFound(SessionId),
    #[error("message {message_id} is already tracked by vote session {owner}")]
    MessageTaken {
        message_id: MessageId,
        owner: SessionId,
    },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

/// Persistence contract for vote sessions, their ballots and the messages
/// they are rendered to.
#[async_trait]
pub trait VoteRepository: Send + Sync {
    /// Insert a new session and return its assigned id.
    ///
    /// Only the session row is written; messages are tracked separately and
    /// ballots are expected to be empty.
    async fn insert_session(&self, session: &VoteSession) -> Result<SessionId, RepositoryError>;

    /// Associate a rendered message with a session.
    ///
    /// A message never moves between sessions: tracking one owned by another
    /// session fails with `MessageTaken`.
    async fn track_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), RepositoryError>;

    /// The session a message is tracked by, open or closed.
    async fn message_owner(&self, message_id: MessageId)
        -> Result<Option<SessionId>, RepositoryError>;

    /// Set a voter's ballot. `None` removes it.
    async fn upsert_vote(
        &self,
        session_id: SessionId,
        voter: UserId,
        weight: Option<i64>,
        emoji: Option<&str>,
    ) -> Result<(), RepositoryError>;

    async fn update_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError>;

    /// Load a session with its messages and ballots, regardless of status.
    async fn get_session(&self, session_id: SessionId)
        -> Result<Option<VoteSession>, RepositoryError>;

    /// Load every open session. Used to rehydrate the registry at startup.
    async fn list_open_sessions(&self) -> Result<Vec<VoteSession>, RepositoryError>;
}
