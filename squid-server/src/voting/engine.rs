//! The vote engine: session creation and reaction event routing.
//!
//! Reaction events are resolved to a live session through the registry and
//! processed while holding that session's mutex, so events for one session
//! run one at a time while different sessions proceed independently.
//!
//! Per event:
//! 1. Resolve the session by message id (no session: ignore).
//! 2. Ignore the bot's own reactions, leaving seeded reactions in place.
//! 3. Lock the session. If it already closed, evict stray registry entries.
//! 4. Retract the reaction (best-effort) so votes stay anonymous.
//! 5. Ignore other bots and unrecognized emojis.
//! 6. Run the trusted-role gate for sessions that need it.
//! 7. Look up the voter's weight and cast the signed ballot.
//! 8. Persist the ballot, then re-render, or close and run close effects.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use squid_core::{
    BuildId, ChannelId, Effect, EmojiSet, FieldChange, MessageId, Outcome, ServerId, SessionError,
    SessionId, SessionResult, SessionStatus, Tally, TargetMessage, Thresholds, UserId, VoteChange,
    VoteSession, MAX_TRACKED_MESSAGES,
};

use super::collaborators::Collaborators;
use super::interpreter::execute_effects;
use super::registry::{SharedSession, VoteSessionRegistry};
use super::repository::{RepositoryError, VoteRepository};

/// Reply sent to a voter who lacks the role a session requires.
pub const UNTRUSTED_VOTER_REPLY: &str = "You do not have a trusted role.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("no open vote session tracks message {0}")]
    UnknownMessage(MessageId),
    #[error("a vote session needs at least one message")]
    NoMessages,
    #[error("message {0} already belongs to an open vote session")]
    MessageInUse(MessageId),
}

/// A reaction added to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    /// `None` for direct messages.
    #[serde(default)]
    pub server_id: Option<ServerId>,
    pub user_id: UserId,
    #[serde(default)]
    pub user_is_bot: bool,
    pub emoji: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NoSession,
    OwnReaction,
    BotVoter,
    UnrecognizedEmoji,
    SessionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotTrusted,
    NoVotingWeight,
    LookupFailed,
}

/// What happened to a reaction event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReactionOutcome {
    Ignored {
        reason: IgnoreReason,
    },
    Rejected {
        reason: RejectReason,
    },
    /// The ballot changed and the session is still open.
    Recorded {
        session_id: Option<SessionId>,
        ballot: Option<i64>,
        tally: Tally,
    },
    /// The ballot closed the session.
    Closed {
        session_id: Option<SessionId>,
        result: SessionResult,
        tally: Tally,
    },
}

impl ReactionOutcome {
    fn ignored(reason: IgnoreReason) -> Self {
        Self::Ignored { reason }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self::Rejected { reason }
    }
}

/// Request to open a vote on a build changeset.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBuildChangeSession {
    pub message_ids: Vec<MessageId>,
    pub author_id: UserId,
    pub build_id: BuildId,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub pass_threshold: Option<u32>,
    #[serde(default)]
    pub fail_threshold: Option<u32>,
    #[serde(default)]
    pub emojis: Option<EmojiSet>,
}

/// Request to open a vote on deleting a log message.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDeleteLogSession {
    pub message_ids: Vec<MessageId>,
    pub author_id: UserId,
    pub target: TargetMessage,
    #[serde(default)]
    pub pass_threshold: Option<u32>,
    #[serde(default)]
    pub fail_threshold: Option<u32>,
    #[serde(default)]
    pub emojis: Option<EmojiSet>,
}

/// Owns the live sessions and routes reaction events into them.
pub struct VoteEngine {
    registry: VoteSessionRegistry,
    repository: Arc<dyn VoteRepository>,
    collab: Collaborators,
    bot_user_id: UserId,
    default_thresholds: Thresholds,
}

impl VoteEngine {
    pub fn new(
        repository: Arc<dyn VoteRepository>,
        collab: Collaborators,
        bot_user_id: UserId,
        default_thresholds: Thresholds,
    ) -> Self {
        Self {
            registry: VoteSessionRegistry::new(),
            repository,
            collab,
            bot_user_id,
            default_thresholds,
        }
    }

    pub fn registry(&self) -> &VoteSessionRegistry {
        &self.registry
    }

    /// Load every open session from the store into the registry.
    ///
    /// Must complete before events are accepted; events for sessions not yet
    /// loaded are ignored.
    ///
    /// A stored session whose ballots already decide it (a crash between the
    /// ballot write and the closure write) is closed here instead, and its
    /// close effects run.
    pub async fn rehydrate(&self) -> Result<usize, RepositoryError> {
        let open = self.repository.list_open_sessions().await?;
        let mut pending = Vec::with_capacity(open.len());
        for session in open {
            match session.evaluate() {
                Outcome::Pending => pending.push(session),
                outcome => self.settle(session, outcome).await,
            }
        }
        Ok(self.registry.rehydrate(pending).await)
    }

    async fn settle(&self, mut session: VoteSession, outcome: Outcome) {
        let result = match session.close(outcome) {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to settle vote session {:?}: {}", session.id(), e);
                return;
            }
        };
        warn!(
            "Vote session {:?} was stored open with a decided tally (net {}); closing as {}",
            session.id(),
            session.tally().net,
            result.as_str()
        );
        let shared: SharedSession = Arc::new(Mutex::new(session));
        let guard = shared.lock().await;
        self.finish_close(&shared, &guard).await;
    }

    pub async fn create_build_change_session(
        &self,
        request: NewBuildChangeSession,
    ) -> Result<VoteSession, EngineError> {
        let thresholds = self.thresholds(request.pass_threshold, request.fail_threshold)?;
        let session = VoteSession::build_change(
            request.build_id,
            request.changes,
            request.message_ids,
            request.author_id,
            thresholds,
        )?;
        self.open_session(with_emojis(session, request.emojis)?).await
    }

    pub async fn create_delete_log_session(
        &self,
        request: NewDeleteLogSession,
    ) -> Result<VoteSession, EngineError> {
        let thresholds = self.thresholds(request.pass_threshold, request.fail_threshold)?;
        let session = VoteSession::delete_log(
            request.target,
            request.message_ids,
            request.author_id,
            thresholds,
        )?;
        self.open_session(with_emojis(session, request.emojis)?).await
    }

    fn thresholds(&self, pass: Option<u32>, fail: Option<u32>) -> Result<Thresholds, SessionError> {
        Thresholds::new(
            pass.unwrap_or(self.default_thresholds.pass()),
            fail.unwrap_or(self.default_thresholds.fail()),
        )
    }

    /// Persist, register and render a freshly built session.
    async fn open_session(&self, mut session: VoteSession) -> Result<VoteSession, EngineError> {
        let message_ids: Vec<MessageId> = session.message_ids().collect();
        if message_ids.is_empty() {
            return Err(EngineError::NoMessages);
        }
        for message_id in &message_ids {
            if self.registry.lookup(*message_id).await.is_some() {
                return Err(EngineError::MessageInUse(*message_id));
            }
            if let Some(owner) = self.repository.message_owner(*message_id).await? {
                debug!("Message {} is owned by vote session {}", message_id, owner);
                return Err(EngineError::MessageInUse(*message_id));
            }
        }

        let session_id = self.repository.insert_session(&session).await?;
        session.assign_id(session_id)?;
        for message_id in &message_ids {
            if let Err(e) = self.repository.track_message(session_id, *message_id).await {
                error!(
                    "Failed to track message {} for vote session {}: {}",
                    message_id, session_id, e
                );
                self.abandon(session_id).await;
                return Err(conflict_or_store(e));
            }
        }

        let snapshot = session.clone();
        let shared: SharedSession = Arc::new(Mutex::new(session));
        self.registry.register(message_ids.iter().copied(), &shared).await;

        execute_effects(&self.collab, vec![snapshot.render_effect()]).await;
        let seed = snapshot.emojis().primary();
        for message_id in &message_ids {
            if let Err(e) = self.collab.messaging.add_reactions(*message_id, &seed).await {
                warn!(
                    "Failed to seed reactions on message {} for vote session {}: {:#}",
                    message_id, session_id, e
                );
            }
        }

        info!(
            "Opened vote session {} ({}) on {} message(s)",
            session_id,
            snapshot.kind(),
            message_ids.len()
        );
        Ok(snapshot)
    }

    /// Mark a half-created session cancelled so it is never rehydrated.
    async fn abandon(&self, session_id: SessionId) {
        let status = SessionStatus::Closed {
            result: SessionResult::Cancelled,
        };
        if let Err(e) = self
            .repository
            .update_session_status(session_id, status)
            .await
        {
            warn!("Failed to abandon vote session {}: {}", session_id, e);
        }
    }

    /// Render an open session to one more message.
    ///
    /// Returns `false` if the message was already tracked.
    pub async fn track_message(
        &self,
        existing: MessageId,
        message_id: MessageId,
    ) -> Result<bool, EngineError> {
        let session = self
            .registry
            .lookup(existing)
            .await
            .ok_or(EngineError::UnknownMessage(existing))?;
        if let Some(owner) = self.registry.lookup(message_id).await {
            if !Arc::ptr_eq(&owner, &session) {
                return Err(EngineError::MessageInUse(message_id));
            }
        }

        let mut guard = session.lock().await;
        if guard.is_closed() {
            return Err(SessionError::Closed.into());
        }
        if guard.tracks_message(message_id) {
            return Ok(false);
        }
        let count = guard.message_ids().count() + 1;
        if count > MAX_TRACKED_MESSAGES {
            return Err(SessionError::TooManyMessages {
                count,
                max: MAX_TRACKED_MESSAGES,
            }
            .into());
        }

        if let Some(session_id) = guard.id() {
            self.repository
                .track_message(session_id, message_id)
                .await
                .map_err(conflict_or_store)?;
        }
        guard.track_message(message_id)?;
        self.registry.register([message_id], &session).await;

        let render = guard.render();
        let effects = vec![Effect::RenderMessages {
            message_ids: vec![message_id],
            render,
        }];
        execute_effects(&self.collab, effects).await;
        let seed = guard.emojis().primary();
        if let Err(e) = self.collab.messaging.add_reactions(message_id, &seed).await {
            warn!("Failed to seed reactions on message {}: {:#}", message_id, e);
        }
        Ok(true)
    }

    /// Close the session tracking `message_id` without a decision.
    pub async fn cancel_session(&self, message_id: MessageId) -> Result<VoteSession, EngineError> {
        let session = self
            .registry
            .lookup(message_id)
            .await
            .ok_or(EngineError::UnknownMessage(message_id))?;

        let mut guard = session.lock().await;
        if guard.is_closed() {
            self.evict(&session, &guard).await;
            return Err(EngineError::UnknownMessage(message_id));
        }
        guard.cancel()?;
        info!("Vote session {:?} cancelled", guard.id());
        self.finish_close(&session, &guard).await;
        Ok(guard.clone())
    }

    /// Process one reaction-add event.
    pub async fn handle_reaction_event(&self, event: &ReactionEvent) -> ReactionOutcome {
        let Some(session) = self.registry.lookup(event.message_id).await else {
            debug!("No vote session for message {}", event.message_id);
            return ReactionOutcome::ignored(IgnoreReason::NoSession);
        };

        if event.user_id == self.bot_user_id {
            return ReactionOutcome::ignored(IgnoreReason::OwnReaction);
        }

        let mut guard = session.lock().await;
        if guard.is_closed() {
            self.evict(&session, &guard).await;
            return ReactionOutcome::ignored(IgnoreReason::SessionClosed);
        }

        if let Err(e) = self
            .collab
            .messaging
            .remove_reaction(event.message_id, event.channel_id, &event.emoji, event.user_id)
            .await
        {
            warn!(
                "Failed to retract reaction {} by user {} on message {}: {:#}",
                event.emoji, event.user_id, event.message_id, e
            );
        }

        if event.user_is_bot {
            return ReactionOutcome::ignored(IgnoreReason::BotVoter);
        }
        let Some(direction) = guard.emojis().classify(&event.emoji) else {
            return ReactionOutcome::ignored(IgnoreReason::UnrecognizedEmoji);
        };

        if guard.payload().requires_trusted_voter() {
            if let Some(reason) = self.check_trusted(event).await {
                return ReactionOutcome::rejected(reason);
            }
        }

        let weight = match self
            .collab
            .weights
            .weight_of(event.server_id, event.user_id)
            .await
        {
            Ok(0) => {
                warn!("User {} has no voting weight", event.user_id);
                return ReactionOutcome::rejected(RejectReason::NoVotingWeight);
            }
            Ok(weight) => weight,
            Err(e) => {
                warn!("Weight lookup failed for user {}: {:#}", event.user_id, e);
                return ReactionOutcome::rejected(RejectReason::LookupFailed);
            }
        };

        let change = match guard.cast_vote(event.user_id, direction.signed(weight)) {
            Ok(change) => change,
            Err(e) => {
                error!("Rejected ballot on vote session {:?}: {}", guard.id(), e);
                return ReactionOutcome::ignored(IgnoreReason::SessionClosed);
            }
        };
        let session_id = guard.id();
        self.persist_ballot(session_id, &change, &event.emoji).await;

        match guard.evaluate() {
            Outcome::Pending => {
                execute_effects(&self.collab, vec![guard.render_effect()]).await;
                ReactionOutcome::Recorded {
                    session_id,
                    ballot: change.current,
                    tally: guard.tally(),
                }
            }
            outcome => {
                let result = match guard.close(outcome) {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Failed to close vote session {:?}: {}", session_id, e);
                        return ReactionOutcome::ignored(IgnoreReason::SessionClosed);
                    }
                };
                info!(
                    "Vote session {:?} reached {} with net {}",
                    session_id,
                    result.as_str(),
                    change.net
                );
                self.finish_close(&session, &guard).await;
                ReactionOutcome::Closed {
                    session_id,
                    result,
                    tally: guard.tally(),
                }
            }
        }
    }

    /// Returns the rejection reason if the voter may not vote.
    async fn check_trusted(&self, event: &ReactionEvent) -> Option<RejectReason> {
        let Some(server_id) = event.server_id else {
            return Some(RejectReason::NotTrusted);
        };
        match self
            .collab
            .permissions
            .has_trusted_role(server_id, event.user_id)
            .await
        {
            Ok(true) => None,
            Ok(false) => {
                let notify = Effect::NotifyVoter {
                    message_id: event.message_id,
                    user_id: event.user_id,
                    text: UNTRUSTED_VOTER_REPLY.to_string(),
                };
                execute_effects(&self.collab, vec![notify]).await;
                Some(RejectReason::NotTrusted)
            }
            Err(e) => {
                warn!("Role lookup failed for user {}: {:#}", event.user_id, e);
                Some(RejectReason::LookupFailed)
            }
        }
    }

    async fn persist_ballot(&self, session_id: Option<SessionId>, change: &VoteChange, emoji: &str) {
        let Some(session_id) = session_id else {
            return;
        };
        let emoji = change.current.map(|_| emoji);
        if let Err(e) = self
            .repository
            .upsert_vote(session_id, change.voter, change.current, emoji)
            .await
        {
            warn!(
                "Failed to persist ballot of user {} on vote session {}: {}",
                change.voter, session_id, e
            );
        }
    }

    /// Persist closure, evict from the registry and run close effects.
    ///
    /// The session stays closed whatever fails here.
    async fn finish_close(&self, session: &SharedSession, closed: &VoteSession) {
        if let Some(session_id) = closed.id() {
            if let Err(e) = self
                .repository
                .update_session_status(session_id, closed.status())
                .await
            {
                error!("Failed to persist closure of vote session {}: {}", session_id, e);
                let alert = format!(
                    "Vote session {} closed but its closure was not saved: {}",
                    session_id, e
                );
                if let Err(e) = self.collab.messaging.alert_operators(&alert).await {
                    warn!("Failed to alert operators: {:#}", e);
                }
            }
        }

        self.evict(session, closed).await;

        let mut effects = vec![closed.render_effect()];
        effects.extend(closed.on_close());
        let failures = execute_effects(&self.collab, effects).await;
        if !failures.is_empty() {
            warn!(
                "{} effect(s) failed while closing vote session {:?}",
                failures.len(),
                closed.id()
            );
        }
    }

    async fn evict(&self, session: &SharedSession, snapshot: &VoteSession) {
        let message_ids: Vec<MessageId> = snapshot.message_ids().collect();
        let removed = self.registry.unregister(message_ids, session).await;
        if removed > 0 {
            debug!(
                "Evicted {} registry entries for vote session {:?}",
                removed,
                snapshot.id()
            );
        }
    }

    /// Snapshots of every open session in the registry, ordered by id.
    pub async fn open_sessions(&self) -> Vec<VoteSession> {
        let mut open = Vec::new();
        for session in self.registry.sessions().await {
            let guard = session.lock().await;
            if guard.is_open() {
                open.push(guard.clone());
            }
        }
        open.sort_by_key(|s| s.id());
        open
    }
}

/// A message claimed by another session is a conflict, not a store failure.
fn conflict_or_store(err: RepositoryError) -> EngineError {
    match err {
        RepositoryError::MessageTaken { message_id, .. } => EngineError::MessageInUse(message_id),
        other => EngineError::Repository(other),
    }
}

fn with_emojis(
    session: VoteSession,
    emojis: Option<EmojiSet>,
) -> Result<VoteSession, SessionError> {
    match emojis {
        Some(emojis) => session.with_emojis(emojis),
        None => Ok(session),
    }
}
