// src/storage/mod.rs

//! Storage seams and their two implementations: Redis (production) and
//! in-memory (tests, single-process tooling). Both give every multi-key
//! transition the same atomicity guarantees.

pub mod memory;
pub mod records;
pub mod redis;
pub mod traits;

pub use memory::MemoryStore;
pub use records::{BucketStatus, CircuitState, CircuitStatus, RateLimitDecision};
pub use redis::{LegacyRedisStore, RedisStore};
pub use traits::{CircuitStore, PoolStore, RateLimitStore};
