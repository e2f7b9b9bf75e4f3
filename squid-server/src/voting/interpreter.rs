//! Effect interpreter.
//!
//! Carries out the effects produced by vote sessions against the
//! collaborators. Effects run sequentially; a failure is logged and
//! execution continues with the rest. Failures of close side effects are
//! also reported to operators.

use tracing::{debug, error, info, warn};

use squid_core::{Effect, LogLevel};

use super::collaborators::Collaborators;

/// A failed effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectError {
    pub effect: &'static str,
    pub message: String,
}

/// Execute `effects` and return the ones that failed.
pub async fn execute_effects(collab: &Collaborators, effects: Vec<Effect>) -> Vec<EffectError> {
    let mut failures = Vec::new();

    for effect in effects {
        let name = effect.name();
        let escalate = effect.is_close_side_effect();
        let subject = describe(&effect);

        if let Err(err) = execute_effect(collab, effect).await {
            let message = format!("{:#}", err);
            error!("Effect {} failed for {}: {}", name, subject, message);

            if escalate {
                let alert = format!(
                    "Vote outcome could not be applied ({} for {}): {}",
                    name, subject, message
                );
                if let Err(alert_err) = collab.messaging.alert_operators(&alert).await {
                    warn!("Failed to alert operators: {:#}", alert_err);
                }
            }

            failures.push(EffectError {
                effect: name,
                message,
            });
        }
    }

    failures
}

async fn execute_effect(collab: &Collaborators, effect: Effect) -> anyhow::Result<()> {
    match effect {
        Effect::RenderMessages {
            message_ids,
            render,
        } => {
            let total = message_ids.len();
            let mut failed = 0;
            for message_id in message_ids {
                if let Err(e) = collab.messaging.edit_message(message_id, &render).await {
                    warn!("Failed to update vote message {}: {:#}", message_id, e);
                    failed += 1;
                }
            }
            if failed > 0 {
                anyhow::bail!("failed to update {} of {} vote messages", failed, total);
            }
            Ok(())
        }

        Effect::NotifyVoter {
            message_id,
            user_id,
            text,
        } => collab.messaging.notify_user(message_id, user_id, &text).await,

        Effect::ApplyChangeset {
            build_id, changes, ..
        } => {
            collab.builds.apply_changeset(build_id, &changes).await?;
            info!("Applied {} change(s) to build {}", changes.len(), build_id);
            Ok(())
        }

        Effect::DeclineChangeset { build_id, .. } => {
            collab.builds.decline_changeset(build_id).await?;
            info!("Declined changeset for build {}", build_id);
            Ok(())
        }

        Effect::DeleteTargetMessage { target, .. } => {
            collab.messaging.delete_message(&target).await?;
            info!("Deleted log message {}", target.message_id);
            Ok(())
        }

        Effect::Log { level, message } => {
            match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            }
            Ok(())
        }
    }
}

fn describe(effect: &Effect) -> String {
    let session = |id: &Option<squid_core::SessionId>| {
        id.map_or_else(|| "unsaved session".to_string(), |id| format!("session {}", id))
    };
    match effect {
        Effect::RenderMessages { message_ids, .. } => format!("{} message(s)", message_ids.len()),
        Effect::NotifyVoter { user_id, .. } => format!("user {}", user_id),
        Effect::ApplyChangeset {
            session_id,
            build_id,
            ..
        }
        | Effect::DeclineChangeset {
            session_id,
            build_id,
        } => format!("build {} ({})", build_id, session(session_id)),
        Effect::DeleteTargetMessage { session_id, target } => {
            format!("message {} ({})", target.message_id, session(session_id))
        }
        Effect::Log { .. } => "log".to_string(),
    }
}
