//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `ENSEMBLE_ACQUIRE_ACTORS_TIMEOUT_SEC`: Give up acquiring actors after this long (default: 1200, 0 disables)
//! - `ENSEMBLE_ACQUIRE_RETRY_INTERVAL_MS`: Acquisition retry cadence (default: 1000)
//! - `ENSEMBLE_NO_ACTIVITY_TIMEOUT_SEC`: Cancel started sessions idle this long (default: 600, 0 disables)
//! - `ENSEMBLE_CLEANUP_INTERVAL_SEC`: Cleanup sweep cadence (default: 10)
//! - `ENSEMBLE_ACTOR_IDLE_TIMEOUT_SEC`: Evict unassigned actors unseen this long (default: 8)
//! - `ENSEMBLE_SESSION_HISTORY_MAX_COUNT`: Completed sessions kept before retirement (default: 100)
//! - `ENSEMBLE_SESSION_HISTORY_MAX_AGE_SEC`: Completed session retention (default: 30 days, 0 disables)
//! - `ENSEMBLE_ACTOR_GROUPS`: JSON array of `{name, tag_predicate, max_parallel_sessions}` (default: none)
//!
//! Timeout values of `0` mean "disabled" (infinite wait), which callers must
//! treat distinctly from "expired".

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::model::ActorGroup;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds before a session stuck in actor acquisition is cancelled. 0 disables.
    pub acquire_actors_timeout_sec: u64,

    /// Milliseconds between acquisition retries.
    pub acquire_retry_interval_ms: u64,

    /// Seconds of inactivity before a started session is cancelled. 0 disables.
    pub no_activity_timeout_sec: u64,

    /// Seconds between cleanup sweeps.
    pub cleanup_interval_sec: u64,

    /// Seconds since last heartbeat before an unassigned actor is evicted.
    pub actor_idle_timeout_sec: u64,

    /// Maximum completed sessions retained in history.
    pub session_history_max_count: usize,

    /// Seconds a completed session is retained. 0 disables age-based retirement.
    pub session_history_max_age_sec: u64,

    /// Concurrency caps over named actor groups.
    pub actor_groups: Vec<ActorGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acquire_actors_timeout_sec: 1200,
            acquire_retry_interval_ms: 1000,
            no_activity_timeout_sec: 600,
            cleanup_interval_sec: 10,
            actor_idle_timeout_sec: 8,
            session_history_max_count: 100,
            session_history_max_age_sec: 30 * 24 * 60 * 60,
            actor_groups: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let acquire_actors_timeout_sec = env::var("ENSEMBLE_ACQUIRE_ACTORS_TIMEOUT_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.acquire_actors_timeout_sec);

        let acquire_retry_interval_ms = env::var("ENSEMBLE_ACQUIRE_RETRY_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.acquire_retry_interval_ms);

        let no_activity_timeout_sec = env::var("ENSEMBLE_NO_ACTIVITY_TIMEOUT_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.no_activity_timeout_sec);

        let cleanup_interval_sec = env::var("ENSEMBLE_CLEANUP_INTERVAL_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cleanup_interval_sec);

        let actor_idle_timeout_sec = env::var("ENSEMBLE_ACTOR_IDLE_TIMEOUT_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.actor_idle_timeout_sec);

        let session_history_max_count = env::var("ENSEMBLE_SESSION_HISTORY_MAX_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.session_history_max_count);

        let session_history_max_age_sec = env::var("ENSEMBLE_SESSION_HISTORY_MAX_AGE_SEC")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.session_history_max_age_sec);

        let actor_groups = match env::var("ENSEMBLE_ACTOR_GROUPS") {
            Ok(raw) => serde_json::from_str(&raw)
                .context("invalid ENSEMBLE_ACTOR_GROUPS (expected a JSON array of groups)")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            acquire_actors_timeout_sec,
            acquire_retry_interval_ms,
            no_activity_timeout_sec,
            cleanup_interval_sec,
            actor_idle_timeout_sec,
            session_history_max_count,
            session_history_max_age_sec,
            actor_groups,
        })
    }

    /// Acquisition timeout, `None` when disabled.
    pub fn acquire_actors_timeout(&self) -> Option<Duration> {
        duration_or_disabled(self.acquire_actors_timeout_sec)
    }

    pub fn acquire_retry_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_interval_ms.max(1))
    }

    /// Activity timeout for started sessions, `None` when disabled.
    pub fn no_activity_timeout(&self) -> Option<Duration> {
        duration_or_disabled(self.no_activity_timeout_sec)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_sec.max(1))
    }

    pub fn actor_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.actor_idle_timeout_sec)
    }

    /// History retention window, `None` when disabled.
    pub fn session_history_max_age(&self) -> Option<Duration> {
        duration_or_disabled(self.session_history_max_age_sec)
    }
}

fn duration_or_disabled(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}
