//! Typed configuration (spec §6 "Configuration").
//!
//! Two-tier precedence — a TOML file, then environment variable
//! overrides — mirroring the teacher's `common::config` layering without
//! carrying forward its macro-generated schema machinery (see
//! DESIGN.md). Missing/invalid required configuration is `FatalConfig`
//! (spec §7): the caller is expected to abort before starting workers.

use serde::Deserialize;
use std::time::Duration;
use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalConfig
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollInterval {
    Fast,
    Normal,
    Slow,
}

impl PollInterval {
    pub fn as_duration(self) -> Duration {
        match self {
            PollInterval::Fast => Duration::from_secs(60),
            PollInterval::Normal => Duration::from_secs(300),
            PollInterval::Slow => Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ai_provider: String,
    pub ai_model: String,
    pub ai_timeout_ms: u64,

    pub rate_read_per_sec: u32,
    pub rate_write_per_sec: u32,
    pub rate_burst: u32,

    pub poll_interval: PollInterval,

    pub confidence_auto: f64,
    pub confidence_review: f64,
    pub confidence_new: f64,

    pub batch_max: usize,
    pub queue_max_attempts: u32,
    pub watch_renewal_margin_min: u64,
    pub learning_pattern_min_support: u32,

    pub database_url: String,
    pub http_bind_addr: String,
    /// Shared-secret bearer token the `http` crate checks on every
    /// `/api/v1` route (spec §6 "all routes require bearer auth").
    pub http_auth_token: String,
    pub log_filter: String,
    pub notification_worker_pool_size: usize,
    pub ai_worker_pool_size: usize,
    pub queue_lease_seconds: u64,
    pub retro_scan_slice_size: usize,
    pub grouping_accuracy_alert_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai_provider: "deterministic-stub".into(),
            ai_model: "stub-v1".into(),
            ai_timeout_ms: 60_000,
            rate_read_per_sec: 5,
            rate_write_per_sec: 5,
            rate_burst: 5,
            poll_interval: PollInterval::Normal,
            confidence_auto: 0.80,
            confidence_review: 0.60,
            confidence_new: 0.40,
            batch_max: 100,
            queue_max_attempts: 3,
            watch_renewal_margin_min: 60,
            learning_pattern_min_support: 3,
            database_url: "sqlite::memory:".into(),
            http_bind_addr: "127.0.0.1:8080".into(),
            http_auth_token: String::new(),
            log_filter: "info".into(),
            notification_worker_pool_size: 8,
            ai_worker_pool_size: 4,
            queue_lease_seconds: 30,
            retro_scan_slice_size: 50,
            grouping_accuracy_alert_threshold: 0.85,
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_only() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, $env:literal, $parse:expr) => {
                if let Ok(raw) = std::env::var($env) {
                    if let Some(parsed) = $parse(raw) {
                        self.$field = parsed;
                    }
                }
            };
        }

        env_override!(ai_provider, "AI_PROVIDER", |r: String| Some(r));
        env_override!(ai_model, "AI_MODEL", |r: String| Some(r));
        env_override!(ai_timeout_ms, "AI_TIMEOUT_MS", |r: String| r.parse().ok());
        env_override!(rate_read_per_sec, "RATE_READ_PER_SEC", |r: String| r
            .parse()
            .ok());
        env_override!(rate_write_per_sec, "RATE_WRITE_PER_SEC", |r: String| r
            .parse()
            .ok());
        env_override!(batch_max, "BATCH_MAX", |r: String| r.parse().ok());
        env_override!(queue_max_attempts, "QUEUE_MAX_ATTEMPTS", |r: String| r
            .parse()
            .ok());
        env_override!(
            watch_renewal_margin_min,
            "WATCH_RENEWAL_MARGIN_MIN",
            |r: String| r.parse().ok()
        );
        env_override!(
            learning_pattern_min_support,
            "LEARNING_PATTERN_MIN_SUPPORT",
            |r: String| r.parse().ok()
        );
        env_override!(confidence_auto, "CONFIDENCE_AUTO", |r: String| r
            .parse()
            .ok());
        env_override!(confidence_review, "CONFIDENCE_REVIEW", |r: String| r
            .parse()
            .ok());
        env_override!(confidence_new, "CONFIDENCE_NEW", |r: String| r.parse().ok());
        env_override!(database_url, "DATABASE_URL", |r: String| Some(r));
        env_override!(http_bind_addr, "HTTP_BIND_ADDR", |r: String| Some(r));
        env_override!(http_auth_token, "HTTP_AUTH_TOKEN", |r: String| Some(r));
        env_override!(log_filter, "LOG_FILTER", |r: String| Some(r));

        if let Ok(raw) = std::env::var("POLL_INTERVAL") {
            self.poll_interval = match raw.to_lowercase().as_str() {
                "fast" => PollInterval::Fast,
                "slow" => PollInterval::Slow,
                _ => PollInterval::Normal,
            };
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::Missing("database_url"));
        }
        for (key, value) in [
            ("confidence_auto", self.confidence_auto),
            ("confidence_review", self.confidence_review),
            ("confidence_new", self.confidence_new),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} is not in [0,1]"),
                });
            }
        }
        if !(self.confidence_new <= self.confidence_review && self.confidence_review <= self.confidence_auto) {
            return Err(ConfigError::Invalid {
                key: "confidence_new/confidence_review/confidence_auto",
                reason: "thresholds must satisfy new <= review <= auto".into(),
            });
        }
        if self.batch_max == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_max",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_order_thresholds() {
        let mut cfg = Config::default();
        cfg.confidence_auto = 0.2;
        cfg.confidence_review = 0.6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn poll_interval_durations_match_spec() {
        assert_eq!(PollInterval::Fast.as_duration().as_secs(), 60);
        assert_eq!(PollInterval::Normal.as_duration().as_secs(), 300);
        assert_eq!(PollInterval::Slow.as_duration().as_secs(), 900);
    }
}
