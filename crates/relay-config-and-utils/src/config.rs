//! Configuration management for the relay.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MIN_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
const DEFAULT_OUTBOX_STALE_SECS: u64 = 5 * 60;
const DEFAULT_REAPER_PERIOD_SECS: u64 = 5 * 60;
const DEFAULT_INBOX_ALERT_THRESHOLD: u64 = 10;
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_RETENTION_PERIOD_SECS: u64 = 24 * 60 * 60;

/// Relay configuration.
///
/// Every field is optional in the JSON file; missing fields take the
/// defaults below. Environment variables (`RELAY_*`) override the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Identity stamped into `locked_by` on claimed messages.
    pub instance_id: String,
    /// Publish attempts before a message is permanently failed.
    pub max_attempts: u32,
    /// Timeout for a single broker publish, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Messages claimed per relay cycle.
    pub batch_size: usize,
    /// Lower bound of the adaptive poll interval, in milliseconds.
    pub min_poll_interval_ms: u64,
    /// Upper bound of the adaptive poll interval, in milliseconds.
    pub max_poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    /// PROCESSING outbox rows locked longer than this are reclaimed.
    pub outbox_stale_threshold_secs: u64,
    pub outbox_reaper_period_secs: u64,
    /// Per-consumer inbox staleness thresholds, in seconds.
    pub inbox_consumer_timeouts_secs: BTreeMap<String, u64>,
    /// Threshold for consumers missing from the table. `None` leaves them alone.
    pub inbox_default_timeout_secs: Option<u64>,
    /// Reclaims for one consumer in one sweep that count as a spike.
    pub inbox_alert_threshold: u64,
    pub inbox_reaper_period_secs: u64,
    pub retention_days: u64,
    pub retention_period_secs: u64,
    /// Base URL of the broker's HTTP publish gateway. `None` runs in dry-run mode.
    pub broker_url: Option<String>,
    pub broker_vhost: String,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            instance_id: default_instance_id(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            publish_timeout_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            min_poll_interval_ms: DEFAULT_MIN_POLL_INTERVAL_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            outbox_stale_threshold_secs: DEFAULT_OUTBOX_STALE_SECS,
            outbox_reaper_period_secs: DEFAULT_REAPER_PERIOD_SECS,
            inbox_consumer_timeouts_secs: BTreeMap::new(),
            inbox_default_timeout_secs: None,
            inbox_alert_threshold: DEFAULT_INBOX_ALERT_THRESHOLD,
            inbox_reaper_period_secs: DEFAULT_REAPER_PERIOD_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            retention_period_secs: DEFAULT_RETENTION_PERIOD_SECS,
            broker_url: None,
            broker_vhost: "/".to_string(),
            broker_username: None,
            broker_password: None,
        }
    }
}

fn default_instance_id() -> String {
    let suffix = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    format!("relay-{}", suffix.trim())
}

impl RelayConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file (if present), then apply
    /// environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `RELAY_*` overrides from an arbitrary lookup.
    ///
    /// Unparseable values are logged and ignored so a typo never takes the
    /// relay down.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("RELAY_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("RELAY_INSTANCE_ID") {
            self.instance_id = v;
        }
        override_parsed(&get, "RELAY_MAX_PUBLISH_ATTEMPTS", &mut self.max_attempts);
        override_parsed(&get, "RELAY_PUBLISH_TIMEOUT_MS", &mut self.publish_timeout_ms);
        override_parsed(&get, "RELAY_BATCH_SIZE", &mut self.batch_size);
        override_parsed(&get, "RELAY_MIN_POLL_INTERVAL_MS", &mut self.min_poll_interval_ms);
        override_parsed(&get, "RELAY_MAX_POLL_INTERVAL_MS", &mut self.max_poll_interval_ms);
        override_parsed(&get, "RELAY_BACKOFF_BASE_MS", &mut self.backoff_base_ms);
        override_parsed(&get, "RELAY_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        override_parsed(&get, "RELAY_BACKOFF_MULTIPLIER", &mut self.backoff_multiplier);
        override_parsed(&get, "RELAY_BACKOFF_JITTER", &mut self.backoff_jitter);
        override_parsed(
            &get,
            "RELAY_OUTBOX_STALE_THRESHOLD_SECS",
            &mut self.outbox_stale_threshold_secs,
        );
        override_parsed(
            &get,
            "RELAY_OUTBOX_REAPER_PERIOD_SECS",
            &mut self.outbox_reaper_period_secs,
        );
        override_parsed(&get, "RELAY_INBOX_ALERT_THRESHOLD", &mut self.inbox_alert_threshold);
        override_parsed(
            &get,
            "RELAY_INBOX_REAPER_PERIOD_SECS",
            &mut self.inbox_reaper_period_secs,
        );
        override_parsed(&get, "RELAY_RETENTION_DAYS", &mut self.retention_days);
        override_parsed(
            &get,
            "RELAY_RETENTION_PERIOD_SECS",
            &mut self.retention_period_secs,
        );

        if let Some(raw) = get("RELAY_INBOX_DEFAULT_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => self.inbox_default_timeout_secs = Some(secs),
                Err(_) => warn!(value = %raw, "Ignoring invalid RELAY_INBOX_DEFAULT_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = get("RELAY_INBOX_CONSUMER_TIMEOUTS") {
            match parse_consumer_timeouts(&raw) {
                Ok(map) => self.inbox_consumer_timeouts_secs = map,
                Err(e) => warn!(error = %e, "Ignoring invalid RELAY_INBOX_CONSUMER_TIMEOUTS"),
            }
        }

        if let Some(v) = get("RELAY_BROKER_URL") {
            self.broker_url = Some(v);
        }
        if let Some(v) = get("RELAY_BROKER_VHOST") {
            self.broker_vhost = v;
        }
        if let Some(v) = get("RELAY_BROKER_USERNAME") {
            self.broker_username = Some(v);
        }
        if let Some(v) = get("RELAY_BROKER_PASSWORD") {
            self.broker_password = Some(v);
        }
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::Config("max_attempts must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(CoreError::Config("batch_size must be at least 1".into()));
        }
        if self.min_poll_interval_ms == 0 || self.min_poll_interval_ms > self.max_poll_interval_ms
        {
            return Err(CoreError::Config(format!(
                "poll interval bounds are invalid: min={}ms max={}ms",
                self.min_poll_interval_ms, self.max_poll_interval_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(CoreError::Config(
                "backoff_jitter must be between 0.0 and 1.0".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CoreError::Config(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn outbox_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.outbox_stale_threshold_secs)
    }

    pub fn outbox_reaper_period(&self) -> Duration {
        Duration::from_secs(self.outbox_reaper_period_secs)
    }

    pub fn inbox_reaper_period(&self) -> Duration {
        Duration::from_secs(self.inbox_reaper_period_secs)
    }

    /// Per-consumer thresholds as durations.
    pub fn inbox_consumer_timeouts(&self) -> BTreeMap<String, Duration> {
        self.inbox_consumer_timeouts_secs
            .iter()
            .map(|(consumer, secs)| (consumer.clone(), Duration::from_secs(*secs)))
            .collect()
    }

    pub fn inbox_default_timeout(&self) -> Option<Duration> {
        self.inbox_default_timeout_secs.map(Duration::from_secs)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }
}

fn override_parsed<G, T>(get: &G, name: &str, target: &mut T)
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = get(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = name, value = %raw, "Ignoring invalid override"),
        }
    }
}

/// Parse `consumer=seconds` pairs separated by commas.
///
/// `"webhook-dispatch=60, nightly-import=7200"`
pub fn parse_consumer_timeouts(raw: &str) -> CoreResult<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (consumer, secs) = entry
            .split_once('=')
            .ok_or_else(|| CoreError::Config(format!("expected consumer=seconds, got '{entry}'")))?;
        let consumer = consumer.trim();
        if consumer.is_empty() {
            return Err(CoreError::Config(format!("empty consumer id in '{entry}'")));
        }
        let secs = secs
            .trim()
            .parse::<u64>()
            .map_err(|_| CoreError::Config(format!("invalid seconds in '{entry}'")))?;
        map.insert(consumer.to_string(), secs);
    }
    Ok(map)
}
