//! Status types for the status endpoint.

use serde::Serialize;

use squid_core::{MessageId, SessionId, SessionKind, SessionPayload, Tally, UserId, VoteSession};

/// Summary statistics for the status page.
#[derive(Debug, Default, Serialize)]
pub struct StatusSummary {
    pub open_sessions: usize,
    pub build_change: usize,
    pub delete_log: usize,
    pub tracked_messages: usize,
}

/// An open session as shown on the status page.
#[derive(Debug, Serialize)]
pub struct SessionStatusEntry {
    pub id: Option<SessionId>,
    pub kind: SessionKind,
    pub subject: String,
    pub author_id: UserId,
    pub message_ids: Vec<MessageId>,
    pub tally: Tally,
    pub pass_threshold: u32,
    pub fail_threshold: u32,
    pub voters: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub sessions: Vec<SessionStatusEntry>,
}

impl StatusData {
    pub fn from_sessions(sessions: Vec<VoteSession>, version: String) -> Self {
        let mut summary = StatusSummary {
            open_sessions: sessions.len(),
            ..Default::default()
        };

        let entries = sessions
            .iter()
            .map(|session| {
                match session.kind() {
                    SessionKind::BuildChange => summary.build_change += 1,
                    SessionKind::DeleteLog => summary.delete_log += 1,
                }
                let message_ids: Vec<MessageId> = session.message_ids().collect();
                summary.tracked_messages += message_ids.len();

                SessionStatusEntry {
                    id: session.id(),
                    kind: session.kind(),
                    subject: subject(session.payload()),
                    author_id: session.author_id(),
                    message_ids,
                    tally: session.tally(),
                    pass_threshold: session.thresholds().pass(),
                    fail_threshold: session.thresholds().fail(),
                    voters: session.ballots().count(),
                }
            })
            .collect();

        Self {
            version,
            summary,
            sessions: entries,
        }
    }
}

fn subject(payload: &SessionPayload) -> String {
    match payload {
        SessionPayload::BuildChange { build_id, changes } => {
            format!("build {} ({} change(s))", build_id, changes.len())
        }
        SessionPayload::DeleteLog { target } => format!("log message {}", target.message_id),
    }
}
