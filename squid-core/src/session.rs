//! The vote session state machine.
//!
//! A session is `Open` until its net tally crosses one of two thresholds (or
//! it is cancelled), after which it is `Closed` for good. Ballots are stored
//! per voter as a single signed weight; every aggregate is re-derived from
//! them on demand so nothing can drift.
//!
//! All operations here are synchronous and free of I/O. Callers persist the
//! returned changes themselves and execute the effects produced on close.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{BuildId, MessageId, SessionId, TargetMessage, UserId};

/// Upper bound on messages a single session renders to.
pub const MAX_TRACKED_MESSAGES: usize = 9;

pub const DEFAULT_APPROVE_EMOJIS: [&str; 2] = ["👍", "✅"];
pub const DEFAULT_DENY_EMOJIS: [&str; 2] = ["👎", "❌"];

/// Rejected session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("vote session is closed")]
    Closed,
    #[error("vote weight must be non-zero")]
    ZeroWeight,
    #[error("cannot close a vote session whose outcome is still pending")]
    PendingOutcome,
    #[error("{which} threshold must be positive")]
    InvalidThreshold { which: &'static str },
    #[error("{which} emoji list must not be empty")]
    EmptyEmojiList { which: &'static str },
    #[error("emoji {emoji} is listed as both approve and deny")]
    AmbiguousEmoji { emoji: String },
    #[error("a vote session tracks at most {max} messages, got {count}")]
    TooManyMessages { count: usize, max: usize },
    #[error("vote session already has id {existing}")]
    AlreadyPersisted { existing: SessionId },
}

/// Discriminates session variants in storage and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    BuildChange,
    DeleteLog,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildChange => "build_change",
            Self::DeleteLog => "delete_log",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_change" => Ok(Self::BuildChange),
            "delete_log" => Ok(Self::DeleteLog),
            other => Err(format!("unknown session kind '{}'", other)),
        }
    }
}

/// One field-level edit proposed for a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Variant-specific data of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionPayload {
    /// Apply `changes` to `build_id` if the vote passes.
    BuildChange {
        build_id: BuildId,
        changes: Vec<FieldChange>,
    },
    /// Delete `target` if the vote passes. Only trusted members may vote.
    DeleteLog { target: TargetMessage },
}

impl SessionPayload {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::BuildChange { .. } => SessionKind::BuildChange,
            Self::DeleteLog { .. } => SessionKind::DeleteLog,
        }
    }

    /// Whether voters must hold a trusted role.
    pub fn requires_trusted_voter(&self) -> bool {
        matches!(self, Self::DeleteLog { .. })
    }
}

/// How a closed session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    Passed,
    Failed,
    Cancelled,
}

impl SessionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SessionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown session result '{}'", other)),
        }
    }
}

/// Lifecycle status. `Open -> Closed` is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed { result: SessionResult },
}

/// Result of evaluating the net tally against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Passed,
    Failed,
}

/// Pass and fail bars, both stored as positive magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pass: u32,
    fail: u32,
}

impl Thresholds {
    pub fn new(pass: u32, fail: u32) -> Result<Self, SessionError> {
        if pass == 0 {
            return Err(SessionError::InvalidThreshold { which: "pass" });
        }
        if fail == 0 {
            return Err(SessionError::InvalidThreshold { which: "fail" });
        }
        Ok(Self { pass, fail })
    }

    pub fn pass(&self) -> u32 {
        self.pass
    }

    pub fn fail(&self) -> u32 {
        self.fail
    }

    /// Classify a net tally.
    pub fn evaluate(&self, net: i64) -> Outcome {
        if net >= i64::from(self.pass) {
            Outcome::Passed
        } else if net <= -i64::from(self.fail) {
            Outcome::Failed
        } else {
            Outcome::Pending
        }
    }
}

/// Derived vote counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tally {
    pub net: i64,
    pub upvotes: i64,
    pub downvotes: i64,
}

/// Which way a reaction votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Approve,
    Deny,
}

impl VoteDirection {
    /// Signed ballot weight for a voter of the given (positive) weight.
    pub fn signed(self, weight: u32) -> i64 {
        match self {
            Self::Approve => i64::from(weight),
            Self::Deny => -i64::from(weight),
        }
    }
}

/// Emojis a session accepts as approve/deny reactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmojiSet {
    pub approve: Vec<String>,
    pub deny: Vec<String>,
}

impl Default for EmojiSet {
    fn default() -> Self {
        Self {
            approve: DEFAULT_APPROVE_EMOJIS.iter().map(|e| e.to_string()).collect(),
            deny: DEFAULT_DENY_EMOJIS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl EmojiSet {
    /// Both lists non-empty and disjoint.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.approve.is_empty() {
            return Err(SessionError::EmptyEmojiList { which: "approve" });
        }
        if self.deny.is_empty() {
            return Err(SessionError::EmptyEmojiList { which: "deny" });
        }
        if let Some(emoji) = self.approve.iter().find(|e| self.deny.contains(e)) {
            return Err(SessionError::AmbiguousEmoji {
                emoji: emoji.clone(),
            });
        }
        Ok(())
    }

    pub fn classify(&self, emoji: &str) -> Option<VoteDirection> {
        if self.approve.iter().any(|e| e == emoji) {
            Some(VoteDirection::Approve)
        } else if self.deny.iter().any(|e| e == emoji) {
            Some(VoteDirection::Deny)
        } else {
            None
        }
    }

    /// The reactions seeded on each tracked message.
    pub fn primary(&self) -> Vec<String> {
        self.approve
            .first()
            .into_iter()
            .chain(self.deny.first())
            .cloned()
            .collect()
    }
}

/// The effect of a single `cast_vote` call on one voter's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteChange {
    pub voter: UserId,
    pub previous: Option<i64>,
    /// `None` when the vote was toggled off.
    pub current: Option<i64>,
    pub net: i64,
}

/// Every field of a session, used to rebuild one from storage.
#[derive(Debug, Clone)]
pub struct SessionParts {
    pub id: Option<SessionId>,
    pub status: SessionStatus,
    pub message_ids: Vec<MessageId>,
    pub author_id: UserId,
    pub thresholds: Thresholds,
    pub emojis: EmojiSet,
    pub ballots: Vec<(UserId, i64)>,
    pub payload: SessionPayload,
}

/// A weighted vote on a single question, rendered to one or more messages.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteSession {
    id: Option<SessionId>,
    status: SessionStatus,
    message_ids: BTreeSet<MessageId>,
    author_id: UserId,
    thresholds: Thresholds,
    emojis: EmojiSet,
    ballots: BTreeMap<UserId, i64>,
    payload: SessionPayload,
}

impl VoteSession {
    /// Create a fresh, unpersisted, open session.
    pub fn new(
        payload: SessionPayload,
        message_ids: impl IntoIterator<Item = MessageId>,
        author_id: UserId,
        thresholds: Thresholds,
    ) -> Result<Self, SessionError> {
        let message_ids: BTreeSet<MessageId> = message_ids.into_iter().collect();
        check_message_count(message_ids.len())?;
        Ok(Self {
            id: None,
            status: SessionStatus::Open,
            message_ids,
            author_id,
            thresholds,
            emojis: EmojiSet::default(),
            ballots: BTreeMap::new(),
            payload,
        })
    }

    pub fn build_change(
        build_id: BuildId,
        changes: Vec<FieldChange>,
        message_ids: impl IntoIterator<Item = MessageId>,
        author_id: UserId,
        thresholds: Thresholds,
    ) -> Result<Self, SessionError> {
        Self::new(
            SessionPayload::BuildChange { build_id, changes },
            message_ids,
            author_id,
            thresholds,
        )
    }

    pub fn delete_log(
        target: TargetMessage,
        message_ids: impl IntoIterator<Item = MessageId>,
        author_id: UserId,
        thresholds: Thresholds,
    ) -> Result<Self, SessionError> {
        Self::new(
            SessionPayload::DeleteLog { target },
            message_ids,
            author_id,
            thresholds,
        )
    }

    /// Replace the default approve/deny emojis.
    pub fn with_emojis(mut self, emojis: EmojiSet) -> Result<Self, SessionError> {
        emojis.validate()?;
        self.emojis = emojis;
        Ok(self)
    }

    /// Rebuild a session from persisted parts. Zero-weight ballots are dropped.
    pub fn from_parts(parts: SessionParts) -> Result<Self, SessionError> {
        let message_ids: BTreeSet<MessageId> = parts.message_ids.into_iter().collect();
        check_message_count(message_ids.len())?;
        parts.emojis.validate()?;
        Ok(Self {
            id: parts.id,
            status: parts.status,
            message_ids,
            author_id: parts.author_id,
            thresholds: parts.thresholds,
            emojis: parts.emojis,
            ballots: parts
                .ballots
                .into_iter()
                .filter(|(_, weight)| *weight != 0)
                .collect(),
            payload: parts.payload,
        })
    }

    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    /// Record the store-assigned id. Allowed exactly once.
    pub fn assign_id(&mut self, id: SessionId) -> Result<(), SessionError> {
        if let Some(existing) = self.id {
            return Err(SessionError::AlreadyPersisted { existing });
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn kind(&self) -> SessionKind {
        self.payload.kind()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.message_ids.iter().copied()
    }

    pub fn tracks_message(&self, message_id: MessageId) -> bool {
        self.message_ids.contains(&message_id)
    }

    pub fn author_id(&self) -> UserId {
        self.author_id
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn emojis(&self) -> &EmojiSet {
        &self.emojis
    }

    pub fn payload(&self) -> &SessionPayload {
        &self.payload
    }

    pub fn ballot(&self, voter: UserId) -> Option<i64> {
        self.ballots.get(&voter).copied()
    }

    pub fn ballots(&self) -> impl Iterator<Item = (UserId, i64)> + '_ {
        self.ballots.iter().map(|(voter, weight)| (*voter, *weight))
    }

    /// Add another message this session renders to.
    ///
    /// Returns `false` if the message was already tracked.
    pub fn track_message(&mut self, message_id: MessageId) -> Result<bool, SessionError> {
        if self.message_ids.contains(&message_id) {
            return Ok(false);
        }
        check_message_count(self.message_ids.len() + 1)?;
        Ok(self.message_ids.insert(message_id))
    }

    /// Cast or retract a ballot.
    ///
    /// Casting the weight the voter already holds removes the ballot; any
    /// other weight replaces it outright.
    pub fn cast_vote(&mut self, voter: UserId, weight: i64) -> Result<VoteChange, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if weight == 0 {
            return Err(SessionError::ZeroWeight);
        }

        let previous = self.ballots.get(&voter).copied();
        let current = if previous == Some(weight) {
            self.ballots.remove(&voter);
            None
        } else {
            self.ballots.insert(voter, weight);
            Some(weight)
        };

        Ok(VoteChange {
            voter,
            previous,
            current,
            net: self.tally().net,
        })
    }

    pub fn tally(&self) -> Tally {
        self.ballots
            .values()
            .fold(Tally::default(), |mut tally, &weight| {
                tally.net += weight;
                if weight > 0 {
                    tally.upvotes += weight;
                } else {
                    tally.downvotes -= weight;
                }
                tally
            })
    }

    /// Closed sessions report the outcome they closed with.
    pub fn evaluate(&self) -> Outcome {
        match self.status {
            SessionStatus::Closed {
                result: SessionResult::Passed,
            } => Outcome::Passed,
            SessionStatus::Closed {
                result: SessionResult::Failed,
            } => Outcome::Failed,
            _ => self.thresholds.evaluate(self.tally().net),
        }
    }

    /// Close the session with a decided outcome.
    pub fn close(&mut self, outcome: Outcome) -> Result<SessionResult, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let result = match outcome {
            Outcome::Pending => return Err(SessionError::PendingOutcome),
            Outcome::Passed => SessionResult::Passed,
            Outcome::Failed => SessionResult::Failed,
        };
        self.status = SessionStatus::Closed { result };
        Ok(result)
    }

    /// Close the session without a decision.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.status = SessionStatus::Closed {
            result: SessionResult::Cancelled,
        };
        Ok(())
    }
}

fn check_message_count(count: usize) -> Result<(), SessionError> {
    if count > MAX_TRACKED_MESSAGES {
        return Err(SessionError::TooManyMessages {
            count,
            max: MAX_TRACKED_MESSAGES,
        });
    }
    Ok(())
}
