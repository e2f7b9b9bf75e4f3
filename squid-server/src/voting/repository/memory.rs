//! In-memory implementation of `VoteRepository`.
//!
//! Everything is lost on restart. Used by tests and as a reference for the
//! semantics the SQLite backend must match.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use squid_core::{
    EmojiSet, MessageId, SessionId, SessionParts, SessionPayload, SessionStatus, Thresholds,
    UserId, VoteSession,
};

use super::{RepositoryError, VoteRepository};

#[derive(Debug, Clone)]
struct SessionRow {
    status: SessionStatus,
    author_id: UserId,
    thresholds: Thresholds,
    emojis: EmojiSet,
    payload: SessionPayload,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    sessions: HashMap<SessionId, SessionRow>,
    messages: HashMap<MessageId, SessionId>,
    /// Ballot weight and the emoji it was cast with.
    votes: HashMap<(SessionId, UserId), (i64, Option<String>)>,
}

impl Tables {
    fn assemble(&self, id: SessionId) -> Result<Option<VoteSession>, RepositoryError> {
        let Some(row) = self.sessions.get(&id) else {
            return Ok(None);
        };

        let mut message_ids: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|(_, session_id)| **session_id == id)
            .map(|(message_id, _)| *message_id)
            .collect();
        message_ids.sort();

        let ballots = self
            .votes
            .iter()
            .filter(|((session_id, _), _)| *session_id == id)
            .map(|((_, voter), (weight, _))| (*voter, *weight))
            .collect();

        VoteSession::from_parts(SessionParts {
            id: Some(id),
            status: row.status,
            message_ids,
            author_id: row.author_id,
            thresholds: row.thresholds,
            emojis: row.emojis.clone(),
            ballots,
            payload: row.payload.clone(),
        })
        .map(Some)
        .map_err(|e| RepositoryError::corruption(format!("vote session {}: {}", id, e)))
    }
}

/// In-memory vote repository backed by a single `RwLock`.
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoteRepository for InMemoryRepository {
    async fn insert_session(&self, session: &VoteSession) -> Result<SessionId, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let id = SessionId(tables.next_id);
        tables.sessions.insert(
            id,
            SessionRow {
                status: session.status(),
                author_id: session.author_id(),
                thresholds: session.thresholds(),
                emojis: session.emojis().clone(),
                payload: session.payload().clone(),
            },
        );
        Ok(id)
    }

    async fn track_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(RepositoryError::NotFound(session_id));
        }
        match tables.messages.get(&message_id) {
            Some(owner) if *owner != session_id => Err(RepositoryError::MessageTaken {
                message_id,
                owner: *owner,
            }),
            Some(_) => Ok(()),
            None => {
                tables.messages.insert(message_id, session_id);
                Ok(())
            }
        }
    }

    async fn message_owner(
        &self,
        message_id: MessageId,
    ) -> Result<Option<SessionId>, RepositoryError> {
        Ok(self.tables.read().await.messages.get(&message_id).copied())
    }

    async fn upsert_vote(
        &self,
        session_id: SessionId,
        voter: UserId,
        weight: Option<i64>,
        emoji: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(RepositoryError::NotFound(session_id));
        }
        match weight {
            Some(weight) if weight != 0 => {
                tables
                    .votes
                    .insert((session_id, voter), (weight, emoji.map(str::to_string)));
            }
            _ => {
                tables.votes.remove(&(session_id, voter));
            }
        }
        Ok(())
    }

    async fn update_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::NotFound(session_id))?;
        row.status = status;
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<VoteSession>, RepositoryError> {
        let tables = self.tables.read().await;
        tables.assemble(session_id)
    }

    async fn list_open_sessions(&self) -> Result<Vec<VoteSession>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut ids: Vec<SessionId> = tables
            .sessions
            .iter()
            .filter(|(_, row)| row.status == SessionStatus::Open)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = tables.assemble(id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}
