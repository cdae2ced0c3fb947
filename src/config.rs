//! Configuration management for sharedgate.
//!
//! Configuration can be read from a YAML file, from `SHAREDGATE__*`
//! environment variables (`SHAREDGATE__STORE__MEMCACHE__ADDRESS`, ...), or
//! both, with the environment taking precedence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{FallbackScope, Rate, DEFAULT_MAX_CAS_RETRIES};
use crate::store::{is_key_safe, MemcacheConfig, MAX_PREFIX_LEN};

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "SHAREDGATE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter tuning
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; no cross-process coordination
    Memory,
    /// Shared memcached server
    #[default]
    Memcache,
}

/// Counter store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Memcached connection settings
    #[serde(default)]
    pub memcache: MemcacheConfig,
}

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Compare-and-swap attempts per rate decision
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

fn default_key_prefix() -> String {
    crate::store::DEFAULT_PREFIX.to_string()
}

fn default_max_cas_retries() -> u32 {
    DEFAULT_MAX_CAS_RETRIES
}

/// Fallback configuration.
///
/// Disabled means fail closed: every decision made while the store is down
/// is a denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Defer to a local token bucket when the store is down
    #[serde(default)]
    pub enabled: bool,

    /// Bucket partitioning
    #[serde(default)]
    pub scope: FallbackScope,

    /// Refill interval of the local bucket in milliseconds
    #[serde(default = "default_fallback_interval_ms")]
    pub interval_ms: u64,

    /// Capacity of the local bucket
    #[serde(default = "default_fallback_burst")]
    pub burst: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scope: FallbackScope::default(),
            interval_ms: default_fallback_interval_ms(),
            burst: default_fallback_burst(),
        }
    }
}

fn default_fallback_interval_ms() -> u64 {
    1000
}

fn default_fallback_burst() -> u32 {
    1
}

impl FallbackConfig {
    /// The rate of the local buckets used for fixed-window calls.
    pub fn rate(&self) -> Rate {
        Rate::every(Duration::from_millis(self.interval_ms)).with_burst(self.burst)
    }
}

impl SharedgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SharedgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file overlaid with environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let config: SharedgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AdmissionError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.limiter.key_prefix;
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(AdmissionError::Config(format!(
                "limiter.key_prefix must be 1..={} bytes",
                MAX_PREFIX_LEN
            )));
        }
        if !is_key_safe(prefix) {
            return Err(AdmissionError::Config(format!(
                "limiter.key_prefix {:?} must be printable ASCII without spaces",
                prefix
            )));
        }
        if self.store.memcache.max_connections == 0 {
            return Err(AdmissionError::Config(
                "store.memcache.max_connections must be at least 1".to_string(),
            ));
        }
        if self.limiter.max_cas_retries == 0 {
            return Err(AdmissionError::Config(
                "limiter.max_cas_retries must be at least 1".to_string(),
            ));
        }
        if self.fallback.enabled {
            self.fallback
                .rate()
                .validate()
                .map_err(|e| AdmissionError::Config(format!("fallback: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SharedgateConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memcache);
        assert_eq!(config.store.memcache.address, "127.0.0.1:11211");
        assert_eq!(config.limiter.key_prefix, "sg");
        assert_eq!(config.limiter.max_cas_retries, DEFAULT_MAX_CAS_RETRIES);
        assert!(!config.fallback.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: memcache
  memcache:
    address: "cache.internal:11211"
    io_timeout_ms: 50
limiter:
  key_prefix: edge
  max_cas_retries: 4
fallback:
  enabled: true
  scope: global
  interval_ms: 250
  burst: 4
"#;
        let config = SharedgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.memcache.address, "cache.internal:11211");
        assert_eq!(config.store.memcache.io_timeout_ms, 50);
        assert_eq!(config.store.memcache.connect_timeout_ms, 250);
        assert_eq!(config.store.memcache.max_connections, 8);
        assert_eq!(config.limiter.key_prefix, "edge");
        assert_eq!(config.limiter.max_cas_retries, 4);
        assert_eq!(config.fallback.scope, FallbackScope::Global);
        assert_eq!(
            config.fallback.rate(),
            Rate::every(Duration::from_millis(250)).with_burst(4)
        );
    }

    #[test]
    fn test_parse_partial_config() {
        let config = SharedgateConfig::from_yaml("store:\n  backend: memory\n").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.fallback.interval_ms, 1000);
    }

    #[test]
    fn test_invalid_fallback_rejected() {
        let yaml = "fallback:\n  enabled: true\n  burst: 0\n";
        assert!(matches!(
            SharedgateConfig::from_yaml(yaml),
            Err(AdmissionError::Config(_))
        ));
    }

    #[test]
    fn test_unusable_key_prefix_rejected() {
        let long = "p".repeat(MAX_PREFIX_LEN + 1);
        for prefix in ["\"\"", "\"my app\"", long.as_str()] {
            let yaml = format!("limiter:\n  key_prefix: {}\n", prefix);
            assert!(matches!(
                SharedgateConfig::from_yaml(&yaml),
                Err(AdmissionError::Config(_))
            ));
        }
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(SharedgateConfig::from_yaml("store:\n  backend: redis\n").is_err());
    }

    #[test]
    fn test_load_from_environment() {
        std::env::set_var("SHAREDGATE__LIMITER__KEY_PREFIX", "envprefix");
        std::env::set_var("SHAREDGATE__LIMITER__MAX_CAS_RETRIES", "3");

        let config = SharedgateConfig::load(None).unwrap();

        std::env::remove_var("SHAREDGATE__LIMITER__KEY_PREFIX");
        std::env::remove_var("SHAREDGATE__LIMITER__MAX_CAS_RETRIES");

        assert_eq!(config.limiter.key_prefix, "envprefix");
        assert_eq!(config.limiter.max_cas_retries, 3);
    }
}
