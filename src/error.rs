// src/error.rs

use thiserror::Error;

/// Errors surfaced by the pool, rate limiter and circuit breaker.
///
/// Expected contention outcomes (no idle member, bucket empty, breaker open,
/// returning a member that is not borrowed) are *not* errors; they are
/// signaled through `Option` / result enums on the operation itself. This
/// type covers infrastructure and configuration faults only.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParsing(#[from] serde_yaml::Error),

    #[error("Redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("Redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to load script '{name}' into Redis: {source}")]
    ScriptLoad {
        name: &'static str,
        #[source]
        source: redis::RedisError,
    },

    #[error("Script '{name}' returned a malformed reply: {detail}")]
    ScriptReply { name: &'static str, detail: String },
}

impl From<deadpool_redis::CreatePoolError> for PoolError {
    fn from(e: deadpool_redis::CreatePoolError) -> Self {
        PoolError::Config(format!("Failed to create Redis pool: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
