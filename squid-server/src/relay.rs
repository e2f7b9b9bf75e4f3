//! HTTP client for the chat gateway relay.
//!
//! The relay owns the platform connection; this service reaches the
//! platform and the build catalogue only through its REST API.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use squid_core::{
    BuildId, ChannelId, FieldChange, MessageId, RenderSpec, ServerId, TargetMessage, UserId,
};

use crate::voting::{BuildCatalogue, MessagingSurface, PermissionGate, WeightProvider};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Roles of a server member as reported by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MemberRoles {
    #[serde(default)]
    pub staff: bool,
    #[serde(default)]
    pub trusted: bool,
}

impl MemberRoles {
    pub fn weight(&self, staff_weight: u32) -> u32 {
        if self.staff {
            staff_weight
        } else {
            1
        }
    }

    /// Staff may vote wherever trusted members may.
    pub fn may_vote_on_gated(&self) -> bool {
        self.trusted || self.staff
    }
}

#[derive(Serialize)]
struct AddReactionsBody<'a> {
    emojis: &'a [String],
}

#[derive(Serialize)]
struct RemoveReactionBody<'a> {
    channel_id: ChannelId,
    emoji: &'a str,
    user_id: UserId,
}

#[derive(Serialize)]
struct ReplyBody<'a> {
    user_id: UserId,
    text: &'a str,
}

#[derive(Serialize)]
struct AlertBody<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ChangesetBody<'a> {
    changes: &'a [FieldChange],
}

pub struct RelayClient {
    client: Client,
    base_url: String,
    token: String,
    staff_weight: u32,
}

impl RelayClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        staff_weight: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("redstone-squid-votes/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            staff_weight,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send with auth and turn non-2xx responses into errors.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to {}", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!("Relay error ({}): {} - {}", what, status, error_text));
        }

        Ok(response)
    }

    pub async fn member_roles(&self, server_id: ServerId, user_id: UserId) -> Result<MemberRoles> {
        let url = self.url(&format!("/servers/{}/members/{}", server_id, user_id));
        let response = self.send(self.client.get(&url), "look up member roles").await?;
        response
            .json()
            .await
            .context("Failed to parse member roles response")
    }
}

#[async_trait]
impl MessagingSurface for RelayClient {
    async fn edit_message(&self, message_id: MessageId, render: &RenderSpec) -> Result<()> {
        let url = self.url(&format!("/messages/{}", message_id));
        self.send(self.client.patch(&url).json(render), "edit message")
            .await?;
        debug!("Updated vote message {}", message_id);
        Ok(())
    }

    async fn add_reactions(&self, message_id: MessageId, emojis: &[String]) -> Result<()> {
        let url = self.url(&format!("/messages/{}/reactions", message_id));
        self.send(
            self.client.post(&url).json(&AddReactionsBody { emojis }),
            "add reactions",
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        message_id: MessageId,
        channel_id: ChannelId,
        emoji: &str,
        user_id: UserId,
    ) -> Result<()> {
        let url = self.url(&format!("/messages/{}/reactions/remove", message_id));
        let body = RemoveReactionBody {
            channel_id,
            emoji,
            user_id,
        };
        self.send(self.client.post(&url).json(&body), "remove reaction")
            .await?;
        Ok(())
    }

    async fn notify_user(&self, message_id: MessageId, user_id: UserId, text: &str) -> Result<()> {
        let url = self.url(&format!("/messages/{}/replies", message_id));
        self.send(
            self.client.post(&url).json(&ReplyBody { user_id, text }),
            "reply to user",
        )
        .await?;
        Ok(())
    }

    async fn delete_message(&self, target: &TargetMessage) -> Result<()> {
        let url = self.url("/messages/delete");
        self.send(self.client.post(&url).json(target), "delete message")
            .await?;
        Ok(())
    }

    async fn alert_operators(&self, text: &str) -> Result<()> {
        let url = self.url("/alerts");
        self.send(
            self.client.post(&url).json(&AlertBody { text }),
            "alert operators",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BuildCatalogue for RelayClient {
    async fn apply_changeset(&self, build_id: BuildId, changes: &[FieldChange]) -> Result<()> {
        let url = self.url(&format!("/builds/{}/changeset", build_id));
        self.send(
            self.client.post(&url).json(&ChangesetBody { changes }),
            "apply changeset",
        )
        .await?;
        Ok(())
    }

    async fn decline_changeset(&self, build_id: BuildId) -> Result<()> {
        let url = self.url(&format!("/builds/{}/decline", build_id));
        self.send(self.client.post(&url), "decline changeset")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WeightProvider for RelayClient {
    async fn weight_of(&self, server_id: Option<ServerId>, user_id: UserId) -> Result<u32> {
        match server_id {
            Some(server_id) => Ok(self
                .member_roles(server_id, user_id)
                .await?
                .weight(self.staff_weight)),
            None => Ok(1),
        }
    }
}

#[async_trait]
impl PermissionGate for RelayClient {
    async fn has_trusted_role(&self, server_id: ServerId, user_id: UserId) -> Result<bool> {
        Ok(self
            .member_roles(server_id, user_id)
            .await?
            .may_vote_on_gated())
    }
}
