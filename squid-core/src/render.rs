//! Surface-independent rendering of a session.

use serde::{Deserialize, Serialize};

use crate::session::{SessionPayload, SessionResult, SessionStatus, VoteSession};

/// A named value shown alongside the session summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// What a tracking message should show. The messaging surface decides how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSpec {
    pub title: String,
    pub description: String,
    pub fields: Vec<RenderField>,
    pub status: SessionStatus,
}

impl VoteSession {
    pub fn render(&self) -> RenderSpec {
        let tally = self.tally();
        let thresholds = self.thresholds();

        let base_title = match self.payload() {
            SessionPayload::BuildChange { build_id, .. } => format!("Vote on build #{}", build_id),
            SessionPayload::DeleteLog { .. } => "Vote to Delete Log".to_string(),
        };
        let title = match self.status() {
            SessionStatus::Open => base_title,
            SessionStatus::Closed { result } => {
                format!("{}: {}", base_title, result_label(result))
            }
        };

        let mut description = match self.payload() {
            SessionPayload::BuildChange { changes, .. } if changes.is_empty() => {
                "No changes proposed.".to_string()
            }
            SessionPayload::BuildChange { changes, .. } => changes
                .iter()
                .map(|c| format!("**{}**: {} → {}", c.field, c.before, c.after))
                .collect::<Vec<_>>()
                .join("\n"),
            SessionPayload::DeleteLog { target } => {
                format!("Delete log message {}.", target.message_id)
            }
        };
        if self.is_open() {
            let primary = self.emojis().primary();
            if let [approve, deny] = primary.as_slice() {
                description.push_str(&format!(
                    "\n\nReact with {} to upvote or {} to downvote.",
                    approve, deny
                ));
            }
        }

        RenderSpec {
            title,
            description,
            fields: vec![
                RenderField {
                    name: "Accept".to_string(),
                    value: format!("{}/{}", tally.upvotes, thresholds.pass()),
                    inline: true,
                },
                RenderField {
                    name: "Deny".to_string(),
                    value: format!("{}/{}", tally.downvotes, thresholds.fail()),
                    inline: true,
                },
                RenderField {
                    name: "Net".to_string(),
                    value: tally.net.to_string(),
                    inline: true,
                },
            ],
            status: self.status(),
        }
    }
}

fn result_label(result: SessionResult) -> &'static str {
    match result {
        SessionResult::Passed => "Passed",
        SessionResult::Failed => "Failed",
        SessionResult::Cancelled => "Cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BuildId, ChannelId, MessageId, ServerId, TargetMessage, UserId};
    use crate::session::{FieldChange, Outcome, Thresholds};

    #[test]
    fn test_render_open_build_session() {
        let mut session = VoteSession::build_change(
            BuildId(12),
            vec![FieldChange {
                field: "title".to_string(),
                before: serde_json::json!("Door"),
                after: serde_json::json!("3x3 Door"),
            }],
            [MessageId(1)],
            UserId(2),
            Thresholds::new(3, 4).unwrap(),
        )
        .unwrap();
        session.cast_vote(UserId(5), 2).unwrap();
        session.cast_vote(UserId(6), -1).unwrap();

        let render = session.render();
        assert_eq!(render.title, "Vote on build #12");
        assert!(render.description.contains("**title**: \"Door\" → \"3x3 Door\""));
        assert!(render.description.contains("React with 👍"));
        assert_eq!(render.fields[0].value, "2/3");
        assert_eq!(render.fields[1].value, "1/4");
        assert_eq!(render.fields[2].value, "1");
        assert_eq!(render.status, SessionStatus::Open);
    }

    #[test]
    fn test_render_closed_delete_log_session() {
        let mut session = VoteSession::delete_log(
            TargetMessage {
                message_id: MessageId(77),
                channel_id: ChannelId(8),
                server_id: ServerId(9),
            },
            [MessageId(1)],
            UserId(2),
            Thresholds::new(1, 1).unwrap(),
        )
        .unwrap();
        session.cast_vote(UserId(5), 1).unwrap();
        session.close(Outcome::Passed).unwrap();

        let render = session.render();
        assert_eq!(render.title, "Vote to Delete Log: Passed");
        assert!(!render.description.contains("React with"));
        assert_eq!(
            render.status,
            SessionStatus::Closed {
                result: SessionResult::Passed
            }
        );
    }
}
