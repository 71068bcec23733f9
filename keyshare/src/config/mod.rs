//! Engine configuration.
//!
//! Defaults match the reference deployment; every value can be overridden
//! from the environment (a `.env` file is loaded by the binary).

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Configuration for the credential pool and entitlement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Upstream API keys seeded into the pool at startup.
    #[serde(default, skip_serializing)]
    pub upstream_keys: Vec<String>,

    /// Maximum users holding one credential at the same time.
    #[serde(default = "default_max_users_per_credential")]
    pub max_users_per_credential: u32,

    /// Length of the one-time trial in hours.
    #[serde(default = "default_trial_hours")]
    pub trial_hours: u32,

    /// Length of one billing period in days.
    #[serde(default = "default_period_days")]
    pub period_days: u32,

    /// Length of the referral grant in days.
    #[serde(default = "default_referral_bonus_days")]
    pub referral_bonus_days: u32,

    /// Inactivity after which a user's credential is reclaimed, in seconds.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    /// Interval between reclaim sweeps, in seconds.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,

    /// Interval between lapsed-subscription sweeps, in seconds.
    #[serde(default = "default_expiry_check_interval_secs")]
    pub expiry_check_interval_secs: u64,

    /// Directory for rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_database_url() -> String {
    "sqlite:keyshare.db?mode=rwc".to_string()
}

fn default_max_users_per_credential() -> u32 {
    5
}

fn default_trial_hours() -> u32 {
    24
}

fn default_period_days() -> u32 {
    30
}

fn default_referral_bonus_days() -> u32 {
    3
}

fn default_idle_threshold_secs() -> u64 {
    600 // 10 minutes
}

fn default_reclaim_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_expiry_check_interval_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            upstream_keys: Vec::new(),
            max_users_per_credential: default_max_users_per_credential(),
            trial_hours: default_trial_hours(),
            period_days: default_period_days(),
            referral_bonus_days: default_referral_bonus_days(),
            idle_threshold_secs: default_idle_threshold_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            expiry_check_interval_secs: default_expiry_check_interval_secs(),
            log_dir: None,
        }
    }
}

/// Parse a numeric environment variable, falling back to `default` when unset.
fn env_number<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("{} must be a number, got '{}'", name, raw))),
        _ => Ok(default),
    }
}

/// Split a comma-separated key list, dropping blanks and duplicates.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

impl EngineConfig {
    /// Create a new EngineConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            upstream_keys: parse_key_list(&std::env::var("UPSTREAM_API_KEYS").unwrap_or_default()),
            max_users_per_credential: env_number(
                "MAX_USERS_PER_CREDENTIAL",
                defaults.max_users_per_credential,
            )?,
            trial_hours: env_number("TRIAL_HOURS", defaults.trial_hours)?,
            period_days: env_number("PERIOD_DAYS", defaults.period_days)?,
            referral_bonus_days: env_number("REFERRAL_BONUS_DAYS", defaults.referral_bonus_days)?,
            idle_threshold_secs: env_number("IDLE_THRESHOLD_SECS", defaults.idle_threshold_secs)?,
            reclaim_interval_secs: env_number(
                "RECLAIM_INTERVAL_SECS",
                defaults.reclaim_interval_secs,
            )?,
            expiry_check_interval_secs: env_number(
                "EXPIRY_CHECK_INTERVAL_SECS",
                defaults.expiry_check_interval_secs,
            )?,
            log_dir: std::env::var("LOG_DIR").ok().filter(|d| !d.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_users_per_credential == 0 {
            return Err(Error::config("MAX_USERS_PER_CREDENTIAL must be at least 1"));
        }
        if self.trial_hours == 0 {
            return Err(Error::config("TRIAL_HOURS must be at least 1"));
        }
        if self.period_days == 0 {
            return Err(Error::config("PERIOD_DAYS must be at least 1"));
        }
        if self.reclaim_interval_secs == 0 || self.expiry_check_interval_secs == 0 {
            return Err(Error::config("sweep intervals must be at least 1 second"));
        }
        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_upstream_keys(mut self, keys: Vec<String>) -> Self {
        self.upstream_keys = keys;
        self
    }

    pub fn with_max_users_per_credential(mut self, max: u32) -> Self {
        self.max_users_per_credential = max;
        self
    }

    pub fn with_trial_hours(mut self, hours: u32) -> Self {
        self.trial_hours = hours;
        self
    }

    pub fn with_period_days(mut self, days: u32) -> Self {
        self.period_days = days;
        self
    }

    pub fn with_referral_bonus_days(mut self, days: u32) -> Self {
        self.referral_bonus_days = days;
        self
    }

    pub fn with_idle_threshold_secs(mut self, secs: u64) -> Self {
        self.idle_threshold_secs = secs;
        self
    }

    pub fn with_reclaim_interval_secs(mut self, secs: u64) -> Self {
        self.reclaim_interval_secs = secs;
        self
    }

    pub fn trial_window(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::from(self.trial_hours))
    }

    pub fn period(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.period_days))
    }

    pub fn referral_bonus(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.referral_bonus_days))
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }
}
