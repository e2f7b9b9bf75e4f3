use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

use squid_core::{Thresholds, UserId};

#[derive(Clone)]
pub struct Config {
    /// Shared secret for `X-Squid-Signature` on inbound webhooks.
    pub webhook_secret: String,
    /// Base URL of the chat gateway relay.
    pub relay_url: String,
    pub relay_token: String,
    /// The bot's own user id. Its reactions are never counted.
    pub bot_user_id: UserId,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Used when a create request does not set its own thresholds.
    pub default_thresholds: Thresholds,
    pub staff_vote_weight: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let webhook_secret = env::var("SQUID_WEBHOOK_SECRET")
            .context("SQUID_WEBHOOK_SECRET environment variable is required")?;
        if webhook_secret.trim().is_empty() {
            bail!("SQUID_WEBHOOK_SECRET must not be empty");
        }

        let relay_url = env::var("SQUID_RELAY_URL")
            .context("SQUID_RELAY_URL environment variable is required")?
            .trim_end_matches('/')
            .to_string();

        let relay_token = env::var("SQUID_RELAY_TOKEN")
            .context("SQUID_RELAY_TOKEN environment variable is required")?;

        let bot_user_id = env::var("SQUID_BOT_USER_ID")
            .context("SQUID_BOT_USER_ID environment variable is required")?
            .parse::<u64>()
            .context("SQUID_BOT_USER_ID must be a valid number")
            .map(UserId)?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let pass = parse_positive(
            "DEFAULT_PASS_THRESHOLD",
            env::var("DEFAULT_PASS_THRESHOLD").ok(),
            3,
        )?;
        let fail = parse_positive(
            "DEFAULT_FAIL_THRESHOLD",
            env::var("DEFAULT_FAIL_THRESHOLD").ok(),
            3,
        )?;
        let default_thresholds = Thresholds::new(pass, fail)?;

        let staff_vote_weight =
            parse_positive("STAFF_VOTE_WEIGHT", env::var("STAFF_VOTE_WEIGHT").ok(), 3)?;

        Ok(Config {
            webhook_secret,
            relay_url,
            relay_token,
            bot_user_id,
            port,
            state_dir,
            default_thresholds,
            staff_vote_weight,
        })
    }
}

/// Parse an optional positive integer setting, falling back to `default`
/// when the value is missing or blank.
pub fn parse_positive(name: &str, value: Option<String>, default: u32) -> Result<u32> {
    let Some(value) = value.filter(|s| !s.trim().is_empty()) else {
        return Ok(default);
    };
    let parsed = value
        .trim()
        .parse::<u32>()
        .with_context(|| format!("{} must be a valid number", name))?;
    if parsed == 0 {
        bail!("{} must be positive", name);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positive_missing_uses_default() {
        assert_eq!(parse_positive("X", None, 3).unwrap(), 3);
    }

    #[test]
    fn test_parse_positive_blank_uses_default() {
        assert_eq!(parse_positive("X", Some("  ".to_string()), 3).unwrap(), 3);
    }

    #[test]
    fn test_parse_positive_valid() {
        assert_eq!(parse_positive("X", Some(" 5 ".to_string()), 3).unwrap(), 5);
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        let err = parse_positive("DEFAULT_PASS_THRESHOLD", Some("0".to_string()), 3).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_parse_positive_rejects_garbage() {
        assert!(parse_positive("X", Some("-1".to_string()), 3).is_err());
        assert!(parse_positive("X", Some("three".to_string()), 3).is_err());
    }
}
