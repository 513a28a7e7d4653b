//! Engine configuration.
//!
//! [`EngineConfig`] carries process-level settings read from `JOB_FORGE_*`
//! environment variables. [`ServicePolicies`] carries per-target resilience
//! settings (breaker thresholds, fallback strategy, throttle limits) loaded from
//! a YAML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::{CircuitBreakerConfig, FallbackConfig};
use crate::resources::ServiceLimit;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The policies file could not be parsed.
    #[error("Invalid policies file {path}: {message}")]
    Policies { path: PathBuf, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-level engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Storage
    /// `sqlite://…` or `redis://…`.
    pub database_url: String,
    /// Root for per-job output directories.
    pub data_root: PathBuf,

    // Workers
    /// Workers started with the pool.
    pub num_workers: usize,
    /// Upper bound for autoscaling.
    pub max_workers: usize,
    /// Concurrently open execution contexts allowed per worker.
    pub max_contexts_per_worker: usize,
    pub autoscale: bool,

    // Job defaults
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,

    // Reconciliation
    pub reconcile_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Extra time a running job gets past its timeout before it is reclaimed.
    pub timeout_grace: Duration,
    pub heartbeat_interval: Duration,
    /// A running job whose heartbeat is older than this is reclaimed.
    pub heartbeat_stale: Duration,

    // Resources
    pub monitor_interval: Duration,
    pub scaling_cooldown: Duration,

    /// YAML file with per-target policies.
    pub policies_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./job-forge.db".to_string(),
            data_root: PathBuf::from("./job-data"),

            num_workers: 2,
            max_workers: 4,
            max_contexts_per_worker: 3,
            autoscale: true,

            default_timeout_secs: 300,
            default_max_retries: 3,

            reconcile_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(600),
            timeout_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_stale: Duration::from_secs(120),

            monitor_interval: Duration::from_secs(30),
            scaling_cooldown: Duration::from_secs(120),

            policies_file: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOB_FORGE_DATABASE_URL`: store URL (default: sqlite://./job-forge.db)
    /// - `JOB_FORGE_DATA_ROOT`: per-job output root (default: ./job-data)
    /// - `JOB_FORGE_NUM_WORKERS` / `JOB_FORGE_MAX_WORKERS`: (default: 2 / 4)
    /// - `JOB_FORGE_MAX_CONTEXTS_PER_WORKER`: (default: 3)
    /// - `JOB_FORGE_AUTOSCALE`: (default: true)
    /// - `JOB_FORGE_DEFAULT_TIMEOUT_SECS` / `JOB_FORGE_DEFAULT_MAX_RETRIES`: (default: 300 / 3)
    /// - `JOB_FORGE_RECONCILE_INTERVAL_SECS`: (default: 30)
    /// - `JOB_FORGE_BACKOFF_BASE_SECS` / `JOB_FORGE_BACKOFF_MAX_SECS`: (default: 60 / 600)
    /// - `JOB_FORGE_TIMEOUT_GRACE_SECS`: (default: 30)
    /// - `JOB_FORGE_HEARTBEAT_INTERVAL_SECS` / `JOB_FORGE_HEARTBEAT_STALE_SECS`: (default: 10 / 120)
    /// - `JOB_FORGE_MONITOR_INTERVAL_SECS` / `JOB_FORGE_SCALING_COOLDOWN_SECS`: (default: 30 / 120)
    /// - `JOB_FORGE_POLICIES_FILE`: YAML policies (default: unset)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("JOB_FORGE_DATABASE_URL") {
            config.database_url = val;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_DATA_ROOT") {
            config.data_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("JOB_FORGE_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "JOB_FORGE_NUM_WORKERS")?;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "JOB_FORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_MAX_CONTEXTS_PER_WORKER") {
            config.max_contexts_per_worker =
                parse_env_value(&val, "JOB_FORGE_MAX_CONTEXTS_PER_WORKER")?;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_AUTOSCALE") {
            config.autoscale = parse_env_bool(&val, "JOB_FORGE_AUTOSCALE")?;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_DEFAULT_TIMEOUT_SECS") {
            config.default_timeout_secs = parse_env_value(&val, "JOB_FORGE_DEFAULT_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("JOB_FORGE_DEFAULT_MAX_RETRIES") {
            config.default_max_retries = parse_env_value(&val, "JOB_FORGE_DEFAULT_MAX_RETRIES")?;
        }

        let durations: [(&str, &mut Duration); 8] = [
            ("JOB_FORGE_RECONCILE_INTERVAL_SECS", &mut config.reconcile_interval),
            ("JOB_FORGE_BACKOFF_BASE_SECS", &mut config.backoff_base),
            ("JOB_FORGE_BACKOFF_MAX_SECS", &mut config.backoff_max),
            ("JOB_FORGE_TIMEOUT_GRACE_SECS", &mut config.timeout_grace),
            ("JOB_FORGE_HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval),
            ("JOB_FORGE_HEARTBEAT_STALE_SECS", &mut config.heartbeat_stale),
            ("JOB_FORGE_MONITOR_INTERVAL_SECS", &mut config.monitor_interval),
            ("JOB_FORGE_SCALING_COOLDOWN_SECS", &mut config.scaling_cooldown),
        ];
        for (key, slot) in durations {
            if let Ok(val) = std::env::var(key) {
                let secs: u64 = parse_env_value(&val, key)?;
                *slot = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("JOB_FORGE_POLICIES_FILE") {
            if !val.is_empty() {
                config.policies_file = Some(PathBuf::from(val));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if !(self.database_url.starts_with("sqlite:") || self.database_url.starts_with("redis"))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "database_url must be a sqlite:// or redis:// URL, got '{}'",
                self.database_url
            )));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.max_workers < self.num_workers {
            return Err(ConfigError::ValidationFailed(
                "max_workers cannot be less than num_workers".to_string(),
            ));
        }

        if self.max_contexts_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_contexts_per_worker must be greater than 0".to_string(),
            ));
        }

        if self.default_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::ValidationFailed(
                "backoff_base cannot exceed backoff_max".to_string(),
            ));
        }

        if self.reconcile_interval.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.monitor_interval.is_zero()
        {
            return Err(ConfigError::ValidationFailed(
                "loop intervals must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_stale <= self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_stale must be longer than heartbeat_interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Loads the policies file if one is configured.
    pub fn load_policies(&self) -> Result<ServicePolicies, ConfigError> {
        match &self.policies_file {
            Some(path) => ServicePolicies::from_yaml_file(path),
            None => Ok(ServicePolicies::default()),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_root = path.into();
        self
    }

    pub fn with_workers(mut self, num: usize, max: usize) -> Self {
        self.num_workers = num;
        self.max_workers = max;
        self
    }

    pub fn with_max_contexts_per_worker(mut self, max: usize) -> Self {
        self.max_contexts_per_worker = max;
        self
    }

    pub fn with_autoscale(mut self, enabled: bool) -> Self {
        self.autoscale = enabled;
        self
    }

    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Builder method to set the retry backoff base and cap.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, stale: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_stale = stale;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_scaling_cooldown(mut self, cooldown: Duration) -> Self {
        self.scaling_cooldown = cooldown;
        self
    }

    pub fn with_policies_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.policies_file = Some(path.into());
        self
    }
}

/// Resilience settings for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    pub breaker: Option<CircuitBreakerConfig>,
    pub fallback: Option<FallbackConfig>,
    pub throttle: Option<ServiceLimit>,
}

/// Per-target resilience settings.
///
/// ```yaml
/// default_breaker:
///   failure_threshold: 5
///   recovery_timeout: 60
///   call_timeout: 300
/// services:
///   hotels:
///     breaker: { failure_threshold: 3, recovery_timeout: 120 }
///     fallback: { strategy: cached_response, cache_ttl: 600 }
///     throttle: { max_concurrent: 2, requests_per_minute: 30 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicies {
    /// Breaker settings for targets without their own entry.
    #[serde(default = "default_breaker")]
    pub default_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServicePolicy>,
}

/// Unknown targets get the standard thresholds. Worker calls are bounded by
/// the job's `timeout_seconds`; `call_timeout` bounds direct breaker calls.
fn default_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig::default().with_call_timeout(Duration::from_secs(300))
}

impl Default for ServicePolicies {
    fn default() -> Self {
        Self {
            default_breaker: default_breaker(),
            services: BTreeMap::new(),
        }
    }
}

impl ServicePolicies {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let policies = Self::from_yaml_str(&content).map_err(|e| ConfigError::Policies {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        policies.validate()?;
        Ok(policies)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let breakers = std::iter::once(("default", &self.default_breaker)).chain(
            self.services
                .iter()
                .filter_map(|(name, p)| p.breaker.as_ref().map(|b| (name.as_str(), b))),
        );
        for (name, breaker) in breakers {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "breaker thresholds for '{}' must be greater than 0",
                    name
                )));
            }
            if breaker.call_timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "breaker call_timeout for '{}' must be greater than 0",
                    name
                )));
            }
        }

        for (name, policy) in &self.services {
            if let Some(fallback) = &policy.fallback {
                if !(0.0..=1.0).contains(&fallback.quality_reduction_factor) {
                    return Err(ConfigError::ValidationFailed(format!(
                        "quality_reduction_factor for '{}' must be between 0.0 and 1.0",
                        name
                    )));
                }
            }
            if let Some(limit) = &policy.throttle {
                if limit.max_concurrent == 0 {
                    return Err(ConfigError::ValidationFailed(format!(
                        "throttle max_concurrent for '{}' must be greater than 0",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Serde helper storing a [`Duration`] as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::FallbackStrategy;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.default_timeout_secs, 300);
        assert_eq!(config.backoff_base, Duration::from_secs(60));
        assert_eq!(config.backoff_max, Duration::from_secs(600));
        assert!(config.autoscale);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = EngineConfig::default()
            .with_workers(4, 2)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_workers"));

        let err = EngineConfig::default()
            .with_database_url("postgres://localhost/jobs")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("database_url"));

        let err = EngineConfig::default()
            .with_backoff(Duration::from_secs(700), Duration::from_secs(600))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("backoff_base"));

        assert!(EngineConfig::default()
            .with_default_timeout_secs(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_env_helpers() {
        assert_eq!(parse_env_value::<u64>("42", "K").unwrap(), 42);
        assert!(matches!(
            parse_env_value::<u64>("forty", "K"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(parse_env_bool("Yes", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }

    #[test]
    fn test_policies_from_yaml() {
        let yaml = r#"
default_breaker:
  failure_threshold: 4
  recovery_timeout: 30
  success_threshold: 1
  call_timeout: 120
services:
  hotels:
    breaker:
      failure_threshold: 3
      recovery_timeout: 1.5
    fallback:
      strategy: reduced_quality
      quality_reduction_factor: 0.25
    throttle:
      max_concurrent: 2
      requests_per_minute: 30
  github: {}
"#;
        let policies = ServicePolicies::from_yaml_str(yaml).unwrap();
        assert!(policies.validate().is_ok());
        assert_eq!(policies.default_breaker.failure_threshold, 4);
        assert_eq!(policies.default_breaker.call_timeout, Duration::from_secs(120));

        let hotels = &policies.services["hotels"];
        let breaker = hotels.breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.recovery_timeout, Duration::from_millis(1500));
        assert_eq!(breaker.success_threshold, 2);

        let fallback = hotels.fallback.as_ref().unwrap();
        assert_eq!(fallback.strategy, FallbackStrategy::ReducedQuality);
        assert_eq!(fallback.cache_ttl, Duration::from_secs(300));
        assert_eq!(hotels.throttle.as_ref().unwrap().max_concurrent, 2);

        assert_eq!(policies.services["github"], ServicePolicy::default());
    }

    #[test]
    fn test_policies_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.yaml");
        std::fs::write(&path, "services:\n  site:\n    throttle:\n      max_concurrent: 0\n")
            .unwrap();
        let err = ServicePolicies::from_yaml_file(&path).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));

        std::fs::write(&path, "services: [not, a, map]\n").unwrap();
        assert!(matches!(
            ServicePolicies::from_yaml_file(&path),
            Err(ConfigError::Policies { .. })
        ));

        let config = EngineConfig::default();
        let defaults = config.load_policies().unwrap();
        assert_eq!(defaults.default_breaker.call_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_shipped_policies_file() {
        let policies =
            ServicePolicies::from_yaml_str(include_str!("../config/policies.yaml")).unwrap();
        policies.validate().unwrap();

        let flaky = &policies.services["flaky"];
        assert_eq!(flaky.breaker.as_ref().unwrap().failure_threshold, 3);
        assert_eq!(
            flaky.fallback.as_ref().unwrap().strategy,
            FallbackStrategy::CachedResponse
        );
        let open_data = policies.services["open_data"].fallback.as_ref().unwrap();
        assert_eq!(open_data.mock_response_template.as_ref().unwrap()["source"], "placeholder");
        assert!(policies.services["github"].breaker.is_none());
    }
}
