//! Effects (side effects as data).
//!
//! Sessions never talk to the platform or the build catalogue directly.
//! They describe what should happen and the server's interpreter carries it
//! out.

use serde::{Deserialize, Serialize};

use crate::ids::{BuildId, MessageId, SessionId, TargetMessage, UserId};
use crate::render::RenderSpec;
use crate::session::{FieldChange, SessionPayload, SessionResult, SessionStatus, VoteSession};

/// Log severity for `Effect::Log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    /// Push a rendering to every listed message.
    RenderMessages {
        message_ids: Vec<MessageId>,
        render: RenderSpec,
    },

    /// Reply to a voter, e.g. to explain a rejected vote.
    NotifyVoter {
        message_id: MessageId,
        user_id: UserId,
        text: String,
    },

    /// Apply an approved changeset to its build.
    ApplyChangeset {
        session_id: Option<SessionId>,
        build_id: BuildId,
        changes: Vec<FieldChange>,
    },

    /// Mark a rejected changeset as declined.
    DeclineChangeset {
        session_id: Option<SessionId>,
        build_id: BuildId,
    },

    /// Delete the message a delete-log vote approved.
    DeleteTargetMessage {
        session_id: Option<SessionId>,
        target: TargetMessage,
    },

    Log { level: LogLevel, message: String },
}

impl Effect {
    /// True for effects that act on the vote's subject once it closes.
    ///
    /// Failures of these cannot be retried by a later vote, so the
    /// interpreter escalates them to operators.
    pub fn is_close_side_effect(&self) -> bool {
        matches!(
            self,
            Effect::ApplyChangeset { .. }
                | Effect::DeclineChangeset { .. }
                | Effect::DeleteTargetMessage { .. }
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Effect::RenderMessages { .. } => "render_messages",
            Effect::NotifyVoter { .. } => "notify_voter",
            Effect::ApplyChangeset { .. } => "apply_changeset",
            Effect::DeclineChangeset { .. } => "decline_changeset",
            Effect::DeleteTargetMessage { .. } => "delete_target_message",
            Effect::Log { .. } => "log",
        }
    }
}

impl VoteSession {
    /// Render to every tracked message.
    pub fn render_effect(&self) -> Effect {
        Effect::RenderMessages {
            message_ids: self.message_ids().collect(),
            render: self.render(),
        }
    }

    /// Variant side effects for a closed session.
    ///
    /// Open sessions produce nothing. Cancelled sessions only log.
    pub fn on_close(&self) -> Vec<Effect> {
        let result = match self.status() {
            SessionStatus::Open => return Vec::new(),
            SessionStatus::Closed { result } => result,
        };
        let session_id = self.id();

        let mut effects = vec![Effect::Log {
            level: LogLevel::Info,
            message: format!(
                "Vote session {} ({}) closed: {}",
                session_id.map_or_else(|| "unsaved".to_string(), |id| id.to_string()),
                self.kind(),
                result.as_str()
            ),
        }];

        match (self.payload(), result) {
            (SessionPayload::BuildChange { build_id, changes }, SessionResult::Passed) => {
                effects.push(Effect::ApplyChangeset {
                    session_id,
                    build_id: *build_id,
                    changes: changes.clone(),
                });
            }
            (SessionPayload::BuildChange { build_id, .. }, SessionResult::Failed) => {
                effects.push(Effect::DeclineChangeset {
                    session_id,
                    build_id: *build_id,
                });
            }
            (SessionPayload::DeleteLog { target }, SessionResult::Passed) => {
                effects.push(Effect::DeleteTargetMessage {
                    session_id,
                    target: *target,
                });
            }
            _ => {}
        }

        effects
    }
}
