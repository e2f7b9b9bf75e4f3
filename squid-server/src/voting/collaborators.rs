//! Outside services the vote engine depends on.
//!
//! Each is a trait so the engine can be driven against in-process fakes in
//! tests and the relay client in production.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use squid_core::{
    BuildId, ChannelId, FieldChange, MessageId, RenderSpec, ServerId, TargetMessage, UserId,
};

/// Chat-platform operations on tracking messages.
#[async_trait]
pub trait MessagingSurface: Send + Sync {
    /// Replace the content of a tracking message.
    async fn edit_message(&self, message_id: MessageId, render: &RenderSpec) -> Result<()>;

    /// Add reactions to a message so voters have something to click.
    async fn add_reactions(&self, message_id: MessageId, emojis: &[String]) -> Result<()>;

    /// Remove one user's reaction from a message.
    async fn remove_reaction(
        &self,
        message_id: MessageId,
        channel_id: ChannelId,
        emoji: &str,
        user_id: UserId,
    ) -> Result<()>;

    /// Reply to a user in the context of a message.
    async fn notify_user(&self, message_id: MessageId, user_id: UserId, text: &str)
        -> Result<()>;

    async fn delete_message(&self, target: &TargetMessage) -> Result<()>;

    /// Post to the operators' channel.
    async fn alert_operators(&self, text: &str) -> Result<()>;
}

/// The build catalogue that build-change votes act on.
#[async_trait]
pub trait BuildCatalogue: Send + Sync {
    async fn apply_changeset(&self, build_id: BuildId, changes: &[FieldChange]) -> Result<()>;

    async fn decline_changeset(&self, build_id: BuildId) -> Result<()>;
}

/// How much a member's vote counts.
#[async_trait]
pub trait WeightProvider: Send + Sync {
    /// Positive weight for a voter. `server_id` is `None` for direct messages.
    async fn weight_of(&self, server_id: Option<ServerId>, user_id: UserId) -> Result<u32>;
}

/// Role checks for sessions restricted to trusted voters.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn has_trusted_role(&self, server_id: ServerId, user_id: UserId) -> Result<bool>;
}

/// Bundle of collaborators handed to the engine and the interpreter.
#[derive(Clone)]
pub struct Collaborators {
    pub messaging: Arc<dyn MessagingSurface>,
    pub builds: Arc<dyn BuildCatalogue>,
    pub weights: Arc<dyn WeightProvider>,
    pub permissions: Arc<dyn PermissionGate>,
}

impl Collaborators {
    /// Use one value for every role, as the relay client does.
    pub fn from_single<T>(client: Arc<T>) -> Self
    where
        T: MessagingSurface + BuildCatalogue + WeightProvider + PermissionGate + 'static,
    {
        Self {
            messaging: client.clone(),
            builds: client.clone(),
            weights: client.clone(),
            permissions: client,
        }
    }
}
