//! Coordination configuration.
//!
//! Loaded from a TOML file, then overridden field by field from `SHUTTLE_*`
//! environment variables, then validated. Every field has a default, so an
//! empty file (or no file) is a valid starting point.
//!
//! ```toml
//! instance_id = "host-a"
//! role = "coordinator-candidate"
//! data_dir = ".shuttle"
//!
//! [lease]
//! stale_threshold_secs = 300
//! renew_interval_secs = 60
//! max_retries = 3
//!
//! [pool]
//! size = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::backoff::BackoffPolicy;
use crate::app::lease_manager::LeaseSettings;
use crate::domain::{InstanceId, RetryPolicy, Role};

pub const ENV_PREFIX: &str = "SHUTTLE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {key}={value:?} is not valid: {reason}")]
    Env {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub stale_threshold_secs: u64,
    pub renew_interval_secs: u64,
    pub max_retries: u32,
    pub verify_delay_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 300,
            renew_interval_secs: 60,
            max_retries: 3,
            verify_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            ttl_secs: 60,
        }
    }
}

/// Retry of individual backend calls (network, rate limits, timeouts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub call_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            multiplier: 2.0,
            call_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub slot_lease_ttl_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            slot_lease_ttl_secs: 900,
            prune_interval_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub instance_id: String,
    pub role: Role,
    pub data_dir: PathBuf,
    /// Idle wait between backlog polls when nothing could be claimed.
    pub poll_interval_secs: u64,
    pub lease: LeaseConfig,
    pub sweep: SweepConfig,
    pub presence: PresenceConfig,
    pub backend: BackendConfig,
    pub pool: PoolConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("shuttle-{}", std::process::id()),
            role: Role::CoordinatorCandidate,
            data_dir: PathBuf::from(".shuttle"),
            poll_interval_secs: 10,
            lease: LeaseConfig::default(),
            sweep: SweepConfig::default(),
            presence: PresenceConfig::default(),
            backend: BackendConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// File (if given) → `SHUTTLE_*` overrides → validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHUTTLE_*` overrides from `vars`; unrelated keys are ignored.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "INSTANCE_ID" => self.instance_id = value,
                "ROLE" => self.role = parse_role(&key, &value)?,
                "DATA_DIR" => self.data_dir = PathBuf::from(value),
                "POLL_INTERVAL_SECS" => self.poll_interval_secs = parse_num(&key, &value)?,
                "STALE_THRESHOLD_SECS" => self.lease.stale_threshold_secs = parse_num(&key, &value)?,
                "RENEW_INTERVAL_SECS" => self.lease.renew_interval_secs = parse_num(&key, &value)?,
                "MAX_RETRIES" => self.lease.max_retries = parse_num(&key, &value)?,
                "VERIFY_DELAY_MS" => self.lease.verify_delay_ms = parse_num(&key, &value)?,
                "SWEEP_INTERVAL_SECS" => self.sweep.interval_secs = parse_num(&key, &value)?,
                "PRESENCE_INTERVAL_SECS" => self.presence.interval_secs = parse_num(&key, &value)?,
                "PRESENCE_TTL_SECS" => self.presence.ttl_secs = parse_num(&key, &value)?,
                "BACKEND_ATTEMPTS" => self.backend.attempts = parse_num(&key, &value)?,
                "BACKEND_TIMEOUT_SECS" => self.backend.call_timeout_secs = parse_num(&key, &value)?,
                "POOL_SIZE" => self.pool.size = parse_num(&key, &value)?,
                "SLOT_LEASE_TTL_SECS" => self.pool.slot_lease_ttl_secs = parse_num(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.instance_id.trim().is_empty() {
            return invalid("instance_id must not be empty".into());
        }
        if self.instance_id.contains('/') {
            return invalid(format!(
                "instance_id {:?} must not contain '/' (owner ids are <instance>/<agent>)",
                self.instance_id
            ));
        }
        for (name, value) in [
            ("lease.stale_threshold_secs", self.lease.stale_threshold_secs),
            ("lease.renew_interval_secs", self.lease.renew_interval_secs),
            ("sweep.interval_secs", self.sweep.interval_secs),
            ("presence.interval_secs", self.presence.interval_secs),
            ("presence.ttl_secs", self.presence.ttl_secs),
            ("backend.call_timeout_secs", self.backend.call_timeout_secs),
            ("pool.slot_lease_ttl_secs", self.pool.slot_lease_ttl_secs),
            ("pool.prune_interval_secs", self.pool.prune_interval_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        // a lease delayed by one or two slow renewals must not be reclaimed
        if self.lease.stale_threshold_secs < self.lease.renew_interval_secs.saturating_mul(3) {
            return invalid(format!(
                "lease.stale_threshold_secs ({}) must be at least 3x lease.renew_interval_secs ({})",
                self.lease.stale_threshold_secs, self.lease.renew_interval_secs
            ));
        }
        if self.presence.ttl_secs <= self.presence.interval_secs {
            return invalid(format!(
                "presence.ttl_secs ({}) must exceed presence.interval_secs ({})",
                self.presence.ttl_secs, self.presence.interval_secs
            ));
        }
        if self.pool.size == 0 {
            return invalid("pool.size must be greater than zero".into());
        }
        if self.backend.attempts == 0 {
            return invalid("backend.attempts must be at least 1".into());
        }
        if self.backend.multiplier.is_nan() || self.backend.multiplier < 1.0 {
            return invalid("backend.multiplier must be at least 1.0".into());
        }
        Ok(())
    }

    pub fn instance(&self) -> InstanceId {
        InstanceId::new(self.instance_id.clone())
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease.renew_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence.interval_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence.ttl_secs)
    }

    pub fn slot_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.pool.slot_lease_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.pool.prune_interval_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            attempts: self.backend.attempts,
            base_delay: Duration::from_millis(self.backend.base_delay_ms),
            multiplier: self.backend.multiplier,
            call_timeout: Duration::from_secs(self.backend.call_timeout_secs),
        }
    }

    pub fn lease_settings(&self) -> LeaseSettings {
        LeaseSettings {
            stale_threshold: Duration::from_secs(self.lease.stale_threshold_secs),
            retry: RetryPolicy::new(self.lease.max_retries),
            verify_delay: Duration::from_millis(self.lease.verify_delay_ms),
            backoff: self.backoff(),
        }
    }
}

fn parse_num<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_role(key: &str, value: &str) -> Result<Role, ConfigError> {
    match value.trim() {
        "worker" => Ok(Role::Worker),
        "coordinator-candidate" => Ok(Role::CoordinatorCandidate),
        _ => Err(ConfigError::Env {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected worker or coordinator-candidate".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        CoordinationConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            instance_id = "host-a"
            role = "worker"

            [lease]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_id, "host-a");
        assert_eq!(config.role, Role::Worker);
        assert_eq!(config.lease.max_retries, 5);
        assert_eq!(config.lease.stale_threshold_secs, 300);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = CoordinationConfig::from_toml_str("instance_id = \"from-file\"").unwrap();
        config
            .apply_env(env(&[
                ("SHUTTLE_INSTANCE_ID", "from-env"),
                ("SHUTTLE_POOL_SIZE", "8"),
                ("SHUTTLE_ROLE", "worker"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.instance_id, "from-env");
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.role, Role::Worker);
    }

    #[test]
    fn malformed_env_value_names_the_variable() {
        let mut config = CoordinationConfig::default();
        let err = config
            .apply_env(env(&[("SHUTTLE_MAX_RETRIES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SHUTTLE_MAX_RETRIES"));
    }

    #[rstest]
    #[case::aggressive_staleness(|c: &mut CoordinationConfig| c.lease.stale_threshold_secs = 100)]
    #[case::presence_ttl_not_above_interval(|c: &mut CoordinationConfig| c.presence.ttl_secs = 15)]
    #[case::empty_pool(|c: &mut CoordinationConfig| c.pool.size = 0)]
    #[case::zero_sweep_interval(|c: &mut CoordinationConfig| c.sweep.interval_secs = 0)]
    #[case::slash_in_instance(|c: &mut CoordinationConfig| c.instance_id = "a/b".into())]
    #[case::no_backend_attempts(|c: &mut CoordinationConfig| c.backend.attempts = 0)]
    fn unsafe_settings_are_rejected(#[case] tweak: fn(&mut CoordinationConfig)) {
        let mut config = CoordinationConfig::default();
        tweak(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn lease_settings_follow_config() {
        let config = CoordinationConfig::default();
        let settings = config.lease_settings();
        assert_eq!(settings.stale_threshold, Duration::from_secs(300));
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.backoff.attempts, 3);
    }
}
