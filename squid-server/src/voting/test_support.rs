//! In-process fakes for exercising the engine without a chat platform.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use squid_core::{
    BuildId, ChannelId, FieldChange, MessageId, RenderSpec, ServerId, SessionId, SessionStatus,
    TargetMessage, UserId, VoteSession,
};

use super::collaborators::{
    BuildCatalogue, Collaborators, MessagingSurface, PermissionGate, WeightProvider,
};
use super::repository::{InMemoryRepository, RepositoryError, VoteRepository};

#[derive(Default)]
pub struct RecordingMessaging {
    edits: Mutex<Vec<(MessageId, RenderSpec)>>,
    reactions_added: Mutex<Vec<(MessageId, Vec<String>)>>,
    reactions_removed: Mutex<Vec<(MessageId, String, UserId)>>,
    notifications: Mutex<Vec<(MessageId, UserId, String)>>,
    deleted: Mutex<Vec<TargetMessage>>,
    alerts: Mutex<Vec<String>>,
    fail_edits: AtomicBool,
    fail_deletes: AtomicBool,
    fail_reaction_removal: AtomicBool,
}

impl RecordingMessaging {
    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reaction_removal(&self, fail: bool) {
        self.fail_reaction_removal.store(fail, Ordering::SeqCst);
    }

    pub fn edits(&self) -> Vec<(MessageId, RenderSpec)> {
        self.edits.lock().unwrap().clone()
    }

    /// Most recent rendering pushed to `message_id`.
    pub fn last_render(&self, message_id: MessageId) -> Option<RenderSpec> {
        self.edits
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == message_id)
            .map(|(_, render)| render.clone())
    }

    pub fn reactions_added(&self) -> Vec<(MessageId, Vec<String>)> {
        self.reactions_added.lock().unwrap().clone()
    }

    pub fn reactions_removed(&self) -> Vec<(MessageId, String, UserId)> {
        self.reactions_removed.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<(MessageId, UserId, String)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<TargetMessage> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingSurface for RecordingMessaging {
    async fn edit_message(&self, message_id: MessageId, render: &RenderSpec) -> Result<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(anyhow!("edit rejected"));
        }
        self.edits
            .lock()
            .unwrap()
            .push((message_id, render.clone()));
        Ok(())
    }

    async fn add_reactions(&self, message_id: MessageId, emojis: &[String]) -> Result<()> {
        self.reactions_added
            .lock()
            .unwrap()
            .push((message_id, emojis.to_vec()));
        Ok(())
    }

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        _channel_id: ChannelId,
        emoji: &str,
        user_id: UserId,
    ) -> Result<()> {
        if self.fail_reaction_removal.load(Ordering::SeqCst) {
            return Err(anyhow!("missing permissions"));
        }
        self.reactions_removed
            .lock()
            .unwrap()
            .push((message_id, emoji.to_string(), user_id));
        Ok(())
    }

    async fn notify_user(&self, message_id: MessageId, user_id: UserId, text: &str) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((message_id, user_id, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, target: &TargetMessage) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("message not found"));
        }
        self.deleted.lock().unwrap().push(*target);
        Ok(())
    }

    async fn alert_operators(&self, text: &str) -> Result<()> {
        self.alerts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBuilds {
    applied: Mutex<Vec<(BuildId, Vec<FieldChange>)>>,
    declined: Mutex<Vec<BuildId>>,
    fail_apply: AtomicBool,
}

impl RecordingBuilds {
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<(BuildId, Vec<FieldChange>)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn declined(&self) -> Vec<BuildId> {
        self.declined.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildCatalogue for RecordingBuilds {
    async fn apply_changeset(&self, build_id: BuildId, changes: &[FieldChange]) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(anyhow!("build {} is locked", build_id));
        }
        self.applied
            .lock()
            .unwrap()
            .push((build_id, changes.to_vec()));
        Ok(())
    }

    async fn decline_changeset(&self, build_id: BuildId) -> Result<()> {
        self.declined.lock().unwrap().push(build_id);
        Ok(())
    }
}

/// Weights and trusted roles keyed by user. Unknown users weigh 1.
#[derive(Default)]
pub struct StaticMembers {
    weights: Mutex<HashMap<UserId, u32>>,
    trusted: Mutex<HashSet<UserId>>,
    fail_lookups: AtomicBool,
}

impl StaticMembers {
    pub fn set_weight(&self, user_id: UserId, weight: u32) {
        self.weights.lock().unwrap().insert(user_id, weight);
    }

    pub fn trust(&self, user_id: UserId) {
        self.trusted.lock().unwrap().insert(user_id);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WeightProvider for StaticMembers {
    async fn weight_of(&self, _server_id: Option<ServerId>, user_id: UserId) -> Result<u32> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(anyhow!("member lookup timed out"));
        }
        Ok(self
            .weights
            .lock()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(1))
    }
}

#[async_trait]
impl PermissionGate for StaticMembers {
    async fn has_trusted_role(&self, _server_id: ServerId, user_id: UserId) -> Result<bool> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(anyhow!("member lookup timed out"));
        }
        Ok(self.trusted.lock().unwrap().contains(&user_id))
    }
}

/// Every fake, shared so tests can inspect what the engine did.
pub struct Fakes {
    pub messaging: Arc<RecordingMessaging>,
    pub builds: Arc<RecordingBuilds>,
    pub members: Arc<StaticMembers>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            messaging: Arc::new(RecordingMessaging::default()),
            builds: Arc::new(RecordingBuilds::default()),
            members: Arc::new(StaticMembers::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            messaging: self.messaging.clone(),
            builds: self.builds.clone(),
            weights: self.members.clone(),
            permissions: self.members.clone(),
        }
    }
}

/// Repository whose vote and status writes can be made to fail.
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryRepository,
    fail_votes: AtomicBool,
    fail_status: AtomicBool,
}

impl FlakyRepository {
    pub fn fail_votes(&self, fail: bool) {
        self.fail_votes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoteRepository for FlakyRepository {
    async fn insert_session(&self, session: &VoteSession) -> Result<SessionId, RepositoryError> {
        self.inner.insert_session(session).await
    }

    async fn track_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), RepositoryError> {
        self.inner.track_message(session_id, message_id).await
    }

    async fn message_owner(
        &self,
        message_id: MessageId,
    ) -> Result<Option<SessionId>, RepositoryError> {
        self.inner.message_owner(message_id).await
    }

    async fn upsert_vote(
        &self,
        session_id: SessionId,
        voter: UserId,
        weight: Option<i64>,
        emoji: Option<&str>,
    ) -> Result<(), RepositoryError> {
        if self.fail_votes.load(Ordering::SeqCst) {
            return Err(RepositoryError::storage("upsert_vote", "disk I/O error"));
        }
        self.inner
            .upsert_vote(session_id, voter, weight, emoji)
            .await
    }

    async fn update_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(RepositoryError::storage(
                "update_session_status",
                "database is locked",
            ));
        }
        self.inner.update_session_status(session_id, status).await
    }

    async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<VoteSession>, RepositoryError> {
        self.inner.get_session(session_id).await
    }

    async fn list_open_sessions(&self) -> Result<Vec<VoteSession>, RepositoryError> {
        self.inner.list_open_sessions().await
    }
}
