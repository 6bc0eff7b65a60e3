use std::{env, fmt::Display, str::FromStr};

use anyhow::{anyhow, Context};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub lock_timeout_ms: u64,
    pub video_completion_percent: u8,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let config = Self {
            database_url,
            max_connections: try_load(&lookup, "LEDGER_MAX_CONNECTIONS", 5)?,
            retry_attempts: try_load(&lookup, "LEDGER_RETRY_ATTEMPTS", 3)?,
            retry_backoff_ms: try_load(&lookup, "LEDGER_RETRY_BACKOFF_MS", 25)?,
            lock_timeout_ms: try_load(&lookup, "LEDGER_LOCK_TIMEOUT_MS", 2000)?,
            video_completion_percent: try_load(&lookup, "LEDGER_VIDEO_COMPLETE_PERCENT", 90)?,
        };

        if config.video_completion_percent == 0 || config.video_completion_percent > 100 {
            return Err(anyhow!(
                "LEDGER_VIDEO_COMPLETE_PERCENT must be between 1 and 100, got {}",
                config.video_completion_percent
            ));
        }

        Ok(config)
    }
}

fn try_load<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key} value {raw:?}: {e}")),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
