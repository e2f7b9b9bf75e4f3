//! Tests for the SQLite vote repository.

use rusqlite::params;

use squid_core::{
    BuildId, ChannelId, EmojiSet, FieldChange, MessageId, ServerId, SessionId, SessionKind,
    SessionPayload, SessionResult, SessionStatus, TargetMessage, Thresholds, UserId, VoteSession,
};

use super::super::{RepositoryError, VoteRepository};
use super::{SqliteRepository, CURRENT_SCHEMA_VERSION};

use proptest::prelude::*;

fn build_session() -> VoteSession {
    VoteSession::build_change(
        BuildId(12),
        vec![FieldChange {
            field: "submission_status".to_string(),
            before: serde_json::json!("pending"),
            after: serde_json::json!("confirmed"),
        }],
        [MessageId(100)],
        UserId(7),
        Thresholds::new(3, 4).unwrap(),
    )
    .unwrap()
}

fn delete_log_session() -> VoteSession {
    VoteSession::delete_log(
        TargetMessage {
            message_id: MessageId(900),
            channel_id: ChannelId(901),
            server_id: ServerId(902),
        },
        [MessageId(200)],
        UserId(8),
        Thresholds::new(1, 1).unwrap(),
    )
    .unwrap()
    .with_emojis(EmojiSet {
        approve: vec!["🗑️".to_string()],
        deny: vec!["🛑".to_string()],
    })
    .unwrap()
}

async fn insert_tracked(repo: &SqliteRepository, session: &VoteSession) -> SessionId {
    let id = repo.insert_session(session).await.unwrap();
    for message_id in session.message_ids() {
        repo.track_message(id, message_id).await.unwrap();
    }
    id
}

#[tokio::test]
async fn test_get_returns_none_for_missing() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    assert!(repo.get_session(SessionId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_then_get_round_trips_every_field() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let original = build_session();
    let id = insert_tracked(&repo, &original).await;

    let loaded = repo.get_session(id).await.unwrap().unwrap();
    assert_eq!(loaded.id(), Some(id));
    assert_eq!(loaded.kind(), SessionKind::BuildChange);
    assert_eq!(loaded.status(), SessionStatus::Open);
    assert_eq!(loaded.author_id(), UserId(7));
    assert_eq!(loaded.thresholds(), Thresholds::new(3, 4).unwrap());
    assert_eq!(loaded.payload(), original.payload());
    assert_eq!(loaded.emojis(), original.emojis());
    assert_eq!(loaded.message_ids().collect::<Vec<_>>(), vec![MessageId(100)]);
}

#[tokio::test]
async fn test_custom_emojis_persist() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let id = insert_tracked(&repo, &delete_log_session()).await;

    let loaded = repo.get_session(id).await.unwrap().unwrap();
    assert_eq!(loaded.emojis().approve, vec!["🗑️".to_string()]);
    assert!(matches!(
        loaded.payload(),
        SessionPayload::DeleteLog { target } if target.message_id == MessageId(900)
    ));
}

#[tokio::test]
async fn test_upsert_vote_replaces_and_removes() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let id = insert_tracked(&repo, &build_session()).await;

    repo.upsert_vote(id, UserId(1), Some(3), Some("👍"))
        .await
        .unwrap();
    repo.upsert_vote(id, UserId(1), Some(-3), Some("👎"))
        .await
        .unwrap();
    repo.upsert_vote(id, UserId(2), Some(1), Some("✅"))
        .await
        .unwrap();

    let loaded = repo.get_session(id).await.unwrap().unwrap();
    assert_eq!(loaded.ballot(UserId(1)), Some(-3));
    assert_eq!(loaded.tally().net, -2);

    repo.upsert_vote(id, UserId(1), None, None).await.unwrap();
    let loaded = repo.get_session(id).await.unwrap().unwrap();
    assert_eq!(loaded.ballot(UserId(1)), None);
    assert_eq!(loaded.tally().net, 1);

    let rows: i64 = repo
        .conn
        .lock()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM votes WHERE session_id = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_vote_emoji_is_recorded() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let id = insert_tracked(&repo, &build_session()).await;
    repo.upsert_vote(id, UserId(1), Some(1), Some("✅"))
        .await
        .unwrap();

    let emoji: Option<String> = repo
        .conn
        .lock()
        .unwrap()
        .query_row(
            "SELECT emoji FROM votes WHERE session_id = ?1 AND user_id = 1",
            params![id.0],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(emoji.as_deref(), Some("✅"));
}

#[tokio::test]
async fn test_vote_for_unknown_session_is_not_found() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let result = repo
        .upsert_vote(SessionId(99), UserId(1), Some(1), None)
        .await;
    assert!(matches!(result, Err(RepositoryError::NotFound(SessionId(99)))));
}

#[tokio::test]
async fn test_message_tracked_by_one_session_only() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let a = insert_tracked(&repo, &build_session()).await;
    let b = repo.insert_session(&build_session()).await.unwrap();

    repo.track_message(a, MessageId(100)).await.unwrap();
    assert!(matches!(
        repo.track_message(b, MessageId(100)).await,
        Err(RepositoryError::MessageTaken { message_id: MessageId(100), owner }) if owner == a
    ));
    repo.track_message(b, MessageId(101)).await.unwrap();
    assert_eq!(repo.message_owner(MessageId(100)).await.unwrap(), Some(a));
    assert_eq!(repo.message_owner(MessageId(101)).await.unwrap(), Some(b));
    assert_eq!(repo.message_owner(MessageId(102)).await.unwrap(), None);

    let loaded = repo.get_session(b).await.unwrap().unwrap();
    assert_eq!(loaded.message_ids().collect::<Vec<_>>(), vec![MessageId(101)]);
}

#[tokio::test]
async fn test_closed_sessions_leave_open_list() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let open = insert_tracked(&repo, &build_session()).await;
    let closed = insert_tracked(&repo, &delete_log_session()).await;

    repo.update_session_status(
        closed,
        SessionStatus::Closed {
            result: SessionResult::Passed,
        },
    )
    .await
    .unwrap();

    let listed = repo.list_open_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), Some(open));

    let reloaded = repo.get_session(closed).await.unwrap().unwrap();
    assert_eq!(
        reloaded.status(),
        SessionStatus::Closed {
            result: SessionResult::Passed
        }
    );
}

#[tokio::test]
async fn test_update_status_of_missing_session() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let result = repo
        .update_session_status(
            SessionId(5),
            SessionStatus::Closed {
                result: SessionResult::Cancelled,
            },
        )
        .await;
    assert!(matches!(result, Err(RepositoryError::NotFound(SessionId(5)))));
}

#[tokio::test]
async fn test_corrupt_session_is_skipped_when_listing() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let good = insert_tracked(&repo, &build_session()).await;
    let bad = insert_tracked(&repo, &build_session()).await;

    repo.conn
        .lock()
        .unwrap()
        .execute(
            "UPDATE vote_sessions SET payload_json = 'not json' WHERE id = ?1",
            params![bad.0],
        )
        .unwrap();

    let listed = repo.list_open_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), Some(good));

    assert!(matches!(
        repo.get_session(bad).await,
        Err(RepositoryError::Corruption { .. })
    ));
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("squid-votes.db");

    let id = {
        let repo = SqliteRepository::new(&path).unwrap();
        let id = insert_tracked(&repo, &build_session()).await;
        repo.upsert_vote(id, UserId(3), Some(3), Some("👍"))
            .await
            .unwrap();
        id
    };

    let reopened = SqliteRepository::new(&path).unwrap();
    let open = reopened.list_open_sessions().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id(), Some(id));
    assert_eq!(open[0].ballot(UserId(3)), Some(3));
}

#[test]
fn test_schema_version_recorded() {
    let repo = SqliteRepository::new_in_memory().unwrap();
    let version: i64 = repo
        .conn
        .lock()
        .unwrap()
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[test]
fn test_newer_schema_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("squid-votes.db");
    {
        let repo = SqliteRepository::new(&path).unwrap();
        repo.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE schema_version SET version = ?1 WHERE id = 1",
                params![CURRENT_SCHEMA_VERSION + 1],
            )
            .unwrap();
    }
    assert!(matches!(
        SqliteRepository::new(&path),
        Err(RepositoryError::Storage { .. })
    ));
}

proptest! {
    /// Whatever sequence of ballot writes happens, reloading yields exactly
    /// the last non-removed weight per voter.
    #[test]
    fn persisted_ballots_match_last_write(
        writes in proptest::collection::vec((1u64..5, prop_oneof![Just(None), (-3i64..=3).prop_map(Some)]), 1..40)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let repo = SqliteRepository::new_in_memory().unwrap();
            let id = insert_tracked(&repo, &build_session()).await;
            let mut expected = std::collections::BTreeMap::new();

            for (voter, weight) in writes {
                repo.upsert_vote(id, UserId(voter), weight, None).await.unwrap();
                match weight {
                    Some(w) if w != 0 => { expected.insert(UserId(voter), w); }
                    _ => { expected.remove(&UserId(voter)); }
                }
            }

            let loaded = repo.get_session(id).await.unwrap().unwrap();
            let actual: std::collections::BTreeMap<_, _> = loaded.ballots().collect();
            prop_assert_eq!(actual, expected);
            Ok(())
        })?;
    }
}
