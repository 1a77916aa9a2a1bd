// src/config.rs

use serde::Deserialize;
use std::{fs, io, path::Path};
use tracing::{info, warn};

use crate::error::{PoolError, Result};

/// Root configuration for the pool subsystem.
///
/// Every manager receives its section at construction; there is no ambient
/// or static configuration anywhere in the crate.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Redis connection URL. When absent, only the in-memory store can be
    /// constructed (test mode).
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub rate_limiter: RateLimiterSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

/// Which pool script generation a Redis store runs.
///
/// `Legacy` keeps the superseded single-purpose scripts (consume-token /
/// record-success / record-failure over the `ready` set) alive behind the
/// same `PoolStore` interface during the migration window.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptGeneration {
    #[default]
    Current,
    Legacy,
}

/// Pool state-machine settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Key namespace prefix for the member hash and status sets.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-member request window ceiling (`remainingTokens` ceiling).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sliding-window length for the per-member token counter.
    #[serde(default = "default_window_duration_millis")]
    pub window_duration_millis: i64,
    /// Consecutive rate-limited returns that trigger a cooldown.
    #[serde(default = "default_rate_limit_cooldown_threshold")]
    pub rate_limit_cooldown_threshold: u32,
    /// Base cooldown length; the effective penalty grows with the
    /// consecutive rate-limit count.
    #[serde(default = "default_cooldown_base_millis")]
    pub cooldown_base_millis: i64,
    /// Health score below which a member is suspended.
    #[serde(default = "default_health_floor")]
    pub health_floor: u8,
    /// Health restored on a successful return.
    #[serde(default = "default_success_health_bonus")]
    pub success_health_bonus: u8,
    /// Health penalty for a 5xx failure.
    #[serde(default = "default_penalty_server_error")]
    pub penalty_server_error: u8,
    /// Health penalty for any other failure.
    #[serde(default = "default_penalty_other")]
    pub penalty_other: u8,
    /// Borrows older than this are reported as leaked.
    #[serde(default = "default_leak_threshold_millis")]
    pub leak_threshold_millis: i64,
    /// Suspended members become recoverable after this long, health
    /// permitting.
    #[serde(default = "default_suspension_recovery_millis")]
    pub suspension_recovery_millis: i64,
    #[serde(default)]
    pub script_generation: ScriptGeneration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_tokens: default_max_tokens(),
            window_duration_millis: default_window_duration_millis(),
            rate_limit_cooldown_threshold: default_rate_limit_cooldown_threshold(),
            cooldown_base_millis: default_cooldown_base_millis(),
            health_floor: default_health_floor(),
            success_health_bonus: default_success_health_bonus(),
            penalty_server_error: default_penalty_server_error(),
            penalty_other: default_penalty_other(),
            leak_threshold_millis: default_leak_threshold_millis(),
            suspension_recovery_millis: default_suspension_recovery_millis(),
            script_generation: ScriptGeneration::default(),
        }
    }
}

/// Token-bucket rate limiter settings. External constraint: 80 requests per
/// 10-minute window per identity.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterSettings {
    #[serde(default = "default_bucket_max_tokens")]
    pub max_tokens: u32,
    /// Tokens per second. Defaults to 80/600.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    #[serde(default = "default_tokens_per_request")]
    pub tokens_per_request: u32,
    /// Unused buckets expire after this long.
    #[serde(default = "default_bucket_ttl_seconds")]
    pub bucket_ttl_seconds: i64,
    /// Cap on the wait projection returned by `wait_time`.
    #[serde(default = "default_max_wait_millis")]
    pub max_wait_millis: i64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_bucket_max_tokens(),
            refill_rate: default_refill_rate(),
            tokens_per_request: default_tokens_per_request(),
            bucket_ttl_seconds: default_bucket_ttl_seconds(),
            max_wait_millis: default_max_wait_millis(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_duration_seconds")]
    pub timeout_duration_seconds: i64,
    #[serde(default = "default_circuit_ttl_seconds")]
    pub ttl_seconds: i64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_duration_seconds: default_timeout_duration_seconds(),
            ttl_seconds: default_circuit_ttl_seconds(),
        }
    }
}

fn default_key_prefix() -> String {
    "useragent:".to_string()
}
fn default_max_tokens() -> u32 {
    80
}
fn default_window_duration_millis() -> i64 {
    600_000
}
fn default_rate_limit_cooldown_threshold() -> u32 {
    5
}
fn default_cooldown_base_millis() -> i64 {
    60_000
}
fn default_health_floor() -> u8 {
    30
}
fn default_success_health_bonus() -> u8 {
    5
}
fn default_penalty_server_error() -> u8 {
    10
}
fn default_penalty_other() -> u8 {
    5
}
fn default_leak_threshold_millis() -> i64 {
    600_000
}
fn default_suspension_recovery_millis() -> i64 {
    3_600_000
}
fn default_bucket_max_tokens() -> u32 {
    80
}
fn default_refill_rate() -> f64 {
    80.0 / 600.0
}
fn default_tokens_per_request() -> u32 {
    1
}
fn default_bucket_ttl_seconds() -> i64 {
    3600
}
fn default_max_wait_millis() -> i64 {
    600_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    3
}
fn default_timeout_duration_seconds() -> i64 {
    600
}
fn default_circuit_ttl_seconds() -> i64 {
    3600
}

/// Loads configuration from a YAML file, falling back to defaults when the
/// file is missing or empty.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let path_str = path.display().to_string();
    match fs::read_to_string(path) {
        Ok(contents) => {
            if contents.trim().is_empty() {
                warn!("Config file '{}' is empty. Using defaults.", path_str);
                return Ok(AppConfig::default());
            }
            let config: AppConfig = serde_yaml::from_str(&contents)?;
            validate(&config)?;
            info!(config.path = %path_str, "Configuration loaded");
            Ok(config)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Config file '{}' not found. Using defaults.", path_str);
            Ok(AppConfig::default())
        }
        Err(e) => Err(PoolError::Io(io::Error::new(
            e.kind(),
            format!("Failed to read config file '{path_str}': {e}"),
        ))),
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.pool.max_tokens == 0 {
        return Err(PoolError::Config("pool.max_tokens must be > 0".into()));
    }
    if config.pool.window_duration_millis <= 0 {
        return Err(PoolError::Config(
            "pool.window_duration_millis must be > 0".into(),
        ));
    }
    if config.pool.health_floor > 100 {
        return Err(PoolError::Config("pool.health_floor must be <= 100".into()));
    }
    if config.rate_limiter.refill_rate <= 0.0 {
        return Err(PoolError::Config(
            "rate_limiter.refill_rate must be > 0".into(),
        ));
    }
    if config.rate_limiter.max_tokens == 0 {
        return Err(PoolError::Config(
            "rate_limiter.max_tokens must be > 0".into(),
        ));
    }
    if config.circuit_breaker.failure_threshold == 0 {
        return Err(PoolError::Config(
            "circuit_breaker.failure_threshold must be > 0".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_constraint() {
        let config = AppConfig::default();
        assert_eq!(config.pool.max_tokens, 80);
        assert_eq!(config.pool.window_duration_millis, 600_000);
        assert_eq!(config.rate_limiter.max_tokens, 80);
        assert!((config.rate_limiter.refill_rate - 80.0 / 600.0).abs() < 1e-9);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_duration_seconds, 600);
    }

    #[test]
    fn rejects_zero_refill_rate() {
        let mut config = AppConfig::default();
        config.rate_limiter.refill_rate = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn parses_script_generation() {
        let yaml = "pool:\n  script_generation: legacy\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.script_generation, ScriptGeneration::Legacy);
    }
}
