// src/storage/traits.rs

use async_trait::async_trait;

use crate::error::Result;
use crate::member::{Disposition, MemberStatus, PoolMember, PoolStats, ReturnOutcome, SessionCredentials};
use crate::storage::records::{BucketStatus, CircuitState, RateLimitDecision};

/// Storage seam for the pool state machine.
///
/// Every method that touches more than one key executes as one atomic unit
/// in the implementation: a Lua script against Redis, or a single mutex hold
/// in the in-memory store. Callers never see a half-applied transition.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Atomically selects an idle member and moves it to borrowed.
    /// `None` is the expected "no member available" outcome, not an error.
    async fn borrow(&self, now_millis: i64) -> Result<Option<i64>>;

    /// Atomically moves a borrowed member to idle, cooldown or suspended
    /// per the outcome. `Disposition::NotBorrowed` signals the precondition
    /// miss.
    async fn give_back(
        &self,
        id: i64,
        outcome: ReturnOutcome,
        now_millis: i64,
    ) -> Result<Disposition>;

    /// Moves every cooldown member whose window elapsed back into rotation.
    /// Returns the recovered count.
    async fn recover_cooldowns(&self, now_millis: i64) -> Result<usize>;

    /// Writes a fresh member hash and adds it to the session_required set.
    async fn insert_member(&self, member: &PoolMember) -> Result<()>;

    /// Reads and decodes one member hash.
    async fn read_member(&self, id: i64) -> Result<Option<PoolMember>>;

    /// Installs issued session credentials: session_required -> idle.
    async fn update_session(&self, id: i64, session: &SessionCredentials) -> Result<()>;

    /// Clears the session: any state -> session_required.
    async fn expire_session(&self, id: i64) -> Result<()>;

    /// Forces the member out of rotation: any state -> suspended.
    async fn suspend(&self, id: i64, now_millis: i64) -> Result<()>;

    /// Recovery from suspension: suspended -> session_required with reset
    /// counters and probation health.
    async fn restore(&self, id: i64) -> Result<()>;

    /// Overwrites the member's health score without touching its status.
    async fn set_health(&self, id: i64, score: u8) -> Result<()>;

    /// Ids currently in the given status set.
    async fn members_in(&self, status: MemberStatus) -> Result<Vec<i64>>;

    /// Derived aggregate over the status sets; never stored.
    async fn pool_stats(&self) -> Result<PoolStats>;

    /// Deletes every member hash and status set.
    async fn clear(&self) -> Result<()>;
}

/// Storage seam for the per-identity token bucket. Deliberately unaware of
/// pool membership: a borrowed member can still be denied a token.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Lazy-refill consume: refills from elapsed time, then debits or
    /// denies, as one atomic unit.
    #[allow(clippy::too_many_arguments)]
    async fn try_consume(
        &self,
        id: i64,
        tokens: u32,
        refill_rate: f64,
        max_tokens: u32,
        ttl_seconds: i64,
        now_millis: i64,
    ) -> Result<RateLimitDecision>;

    /// Reads the bucket record, if one exists.
    async fn bucket_status(&self, id: i64) -> Result<Option<BucketStatus>>;

    /// Reconfigures ceiling and rate, rescaling the stored count
    /// proportionally; never grants tokens beyond the new ceiling.
    async fn update_bucket(&self, id: i64, max_tokens: u32, refill_rate: f64) -> Result<()>;

    async fn delete_bucket(&self, id: i64) -> Result<()>;
}

/// Storage seam for the circuit breaker. Independent keyspace from the pool
/// and the buckets so admission logic and eviction logic can evolve apart.
#[async_trait]
pub trait CircuitStore: Send + Sync {
    /// Atomic failure transition: CLOSED counts toward the threshold and
    /// opens at it; HALF_OPEN reopens immediately.
    async fn record_failure(
        &self,
        id: i64,
        failure_threshold: u32,
        now_millis: i64,
        ttl_seconds: i64,
    ) -> Result<()>;

    /// Atomic success transition: CLOSED resets the failure count;
    /// HALF_OPEN counts toward the close threshold and closes at it.
    async fn record_success(
        &self,
        id: i64,
        success_threshold: u32,
        ttl_seconds: i64,
    ) -> Result<()>;

    /// Reads the circuit record, if one exists.
    async fn read_circuit(&self, id: i64) -> Result<Option<CircuitState>>;

    /// Writes the full circuit record, refreshing the TTL.
    async fn write_circuit(&self, id: i64, state: &CircuitState, ttl_seconds: i64) -> Result<()>;
}
