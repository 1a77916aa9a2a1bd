// src/lib.rs

//! Redis-backed user-agent resource pool for marketplace crawling.
//!
//! Three cooperating pieces share one Redis deployment:
//! - a member pool with an atomic borrow/return lifecycle and health-driven
//!   suspension ([`PoolManager`]),
//! - a per-identity lazy-refill token bucket ([`TokenBucketRateLimiter`]),
//! - a per-identity three-state circuit breaker ([`CircuitBreakerManager`]).
//!
//! All cross-key transitions run as Lua scripts so concurrent workers on
//! separate hosts never observe half-applied state. An in-memory store with
//! identical semantics backs the test suite.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod member;
pub mod pool;
pub mod rate_limiter;
pub mod scripts;
pub mod storage;

use std::sync::Arc;

use deadpool_redis::{Config as RedisConfig, Runtime};

pub use circuit_breaker::CircuitBreakerManager;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, AppConfig, ScriptGeneration};
pub use error::{PoolError, Result};
pub use keys::KeyResolver;
pub use member::{
    Disposition, MemberStatus, PoolMember, PoolStats, ReturnOutcome, SessionCredentials,
};
pub use pool::PoolManager;
pub use rate_limiter::TokenBucketRateLimiter;
pub use storage::{LegacyRedisStore, MemoryStore, RedisStore};

/// The three managers wired over one backing store.
pub struct PoolHandles {
    pub pool: PoolManager,
    pub rate_limiter: TokenBucketRateLimiter,
    pub circuit_breaker: CircuitBreakerManager,
}

/// Connects to Redis and wires every manager.
///
/// The pool store honors `pool.script_generation`; the rate limiter and the
/// circuit breaker always run the current scripts, sharing the same
/// connection pool.
pub async fn bootstrap(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<PoolHandles> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| PoolError::Config("redis_url is required".into()))?;
    let redis_pool = RedisConfig::from_url(url).create_pool(Some(Runtime::Tokio1))?;

    let shared = Arc::new(RedisStore::with_pool(redis_pool.clone(), config).await?);
    let pool_store: Arc<dyn storage::PoolStore> = match config.pool.script_generation {
        ScriptGeneration::Current => shared.clone(),
        ScriptGeneration::Legacy => {
            Arc::new(LegacyRedisStore::with_pool(redis_pool, config).await?)
        }
    };

    Ok(PoolHandles {
        pool: PoolManager::new(pool_store, clock.clone(), config.pool.clone()),
        rate_limiter: TokenBucketRateLimiter::new(
            shared.clone(),
            clock.clone(),
            config.rate_limiter.clone(),
        ),
        circuit_breaker: CircuitBreakerManager::new(
            shared,
            clock,
            config.circuit_breaker.clone(),
        ),
    })
}

/// Wires every manager over one in-memory store. Used by tests and by
/// single-process tooling that has no Redis at hand.
pub fn bootstrap_in_memory(config: &AppConfig, clock: Arc<dyn Clock>) -> PoolHandles {
    let store = Arc::new(MemoryStore::new(config));
    PoolHandles {
        pool: PoolManager::new(store.clone(), clock.clone(), config.pool.clone()),
        rate_limiter: TokenBucketRateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limiter.clone(),
        ),
        circuit_breaker: CircuitBreakerManager::new(store, clock, config.circuit_breaker.clone()),
    }
}
