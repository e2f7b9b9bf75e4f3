//! Message-id to live session lookup.
//!
//! Every tracked message maps to the same shared session, so a session
//! rendered to several messages has one tally and one lock. The session's
//! own mutex serializes vote processing; the registry lock only guards the
//! map and is never held across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use squid_core::{MessageId, VoteSession};

/// A live session and the lock that serializes work on it.
pub type SharedSession = Arc<Mutex<VoteSession>>;

#[derive(Default)]
pub struct VoteSessionRegistry {
    sessions: RwLock<HashMap<MessageId, SharedSession>>,
}

impl VoteSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every id in `message_ids` to `session`.
    ///
    /// An id already mapped to a different session is overwritten; the
    /// caller is expected to have checked ownership in the store.
    pub async fn register(
        &self,
        message_ids: impl IntoIterator<Item = MessageId>,
        session: &SharedSession,
    ) {
        let mut sessions = self.sessions.write().await;
        for message_id in message_ids {
            if let Some(previous) = sessions.insert(message_id, session.clone()) {
                if !Arc::ptr_eq(&previous, session) {
                    warn!(
                        "Message {} was tracked by another live session; replacing",
                        message_id
                    );
                }
            }
        }
    }

    /// Remove every id in `message_ids` that still maps to `session`.
    ///
    /// All ids are removed under one write lock, so no lookup observes a
    /// partially evicted session. Returns the number of entries removed.
    pub async fn unregister(
        &self,
        message_ids: impl IntoIterator<Item = MessageId>,
        session: &SharedSession,
    ) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for message_id in message_ids {
            let owned = sessions
                .get(&message_id)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if owned {
                sessions.remove(&message_id);
                removed += 1;
            }
        }
        removed
    }

    pub async fn lookup(&self, message_id: MessageId) -> Option<SharedSession> {
        self.sessions.read().await.get(&message_id).cloned()
    }

    /// Register persisted open sessions. Closed ones are skipped.
    ///
    /// Returns the number of sessions registered.
    pub async fn rehydrate(&self, loaded: Vec<VoteSession>) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut count = 0;
        for session in loaded {
            if session.is_closed() {
                debug!("Not rehydrating closed vote session {:?}", session.id());
                continue;
            }
            let message_ids: Vec<MessageId> = session.message_ids().collect();
            if message_ids.is_empty() {
                warn!(
                    "Vote session {:?} has no tracked messages; not rehydrating",
                    session.id()
                );
                continue;
            }
            let shared = Arc::new(Mutex::new(session));
            for message_id in message_ids {
                sessions.insert(message_id, shared.clone());
            }
            count += 1;
        }
        info!("Rehydrated {} open vote session(s)", count);
        count
    }

    /// Distinct live sessions, in no particular order.
    pub async fn sessions(&self) -> Vec<SharedSession> {
        let sessions = self.sessions.read().await;
        let mut seen = HashSet::new();
        sessions
            .values()
            .filter(|session| seen.insert(Arc::as_ptr(session)))
            .cloned()
            .collect()
    }

    /// Number of tracked message ids.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
