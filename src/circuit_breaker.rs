// src/circuit_breaker.rs

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerSettings;
use crate::error::Result;
use crate::storage::records::{CircuitState, CircuitStatus};
use crate::storage::traits::CircuitStore;

/// Circuit key namespace, fixed and independent of the pool prefix.
pub fn circuit_key(id: i64) -> String {
    format!("circuit_breaker:{id}")
}

/// Atomic failure transition. Bootstraps a CLOSED record on first contact.
/// CLOSED counts toward the stored threshold and opens at it; HALF_OPEN
/// reopens immediately with a fresh `opened_at`; OPEN is untouched by
/// record calls.
///
/// KEYS: circuit key. ARGV: default_failure_threshold, now_ms, ttl_seconds,
/// default_timeout_seconds.
pub const RECORD_FAILURE: &str = r#"
local key = KEYS[1]
local default_threshold = tonumber(ARGV[1])
local now = ARGV[2]
local ttl = tonumber(ARGV[3])

local state = redis.call('HGET', key, 'state')
if not state then
  redis.call('HSET', key,
    'state', 'CLOSED',
    'consecutive_failures', '0',
    'consecutive_successes', '0',
    'opened_at', '0',
    'failure_threshold', ARGV[1],
    'timeout_duration_seconds', ARGV[4])
  state = 'CLOSED'
end

if state == 'HALF_OPEN' then
  redis.call('HSET', key,
    'state', 'OPEN',
    'consecutive_failures', '0',
    'consecutive_successes', '0',
    'opened_at', now)
elseif state == 'CLOSED' then
  local threshold = tonumber(redis.call('HGET', key, 'failure_threshold'))
    or default_threshold
  local failures = redis.call('HINCRBY', key, 'consecutive_failures', 1)
  if failures >= threshold then
    redis.call('HSET', key,
      'state', 'OPEN',
      'consecutive_failures', '0',
      'consecutive_successes', '0',
      'opened_at', now)
  end
end

redis.call('EXPIRE', key, ttl)
return redis.call('HGET', key, 'state')
"#;

/// Atomic success transition. CLOSED resets the failure count; HALF_OPEN
/// counts toward the close threshold and closes at it, clearing
/// `opened_at`; OPEN is untouched.
///
/// KEYS: circuit key. ARGV: success_threshold, ttl_seconds,
/// default_failure_threshold, default_timeout_seconds.
pub const RECORD_SUCCESS: &str = r#"
local key = KEYS[1]
local success_threshold = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local state = redis.call('HGET', key, 'state')
if not state then
  redis.call('HSET', key,
    'state', 'CLOSED',
    'consecutive_failures', '0',
    'consecutive_successes', '0',
    'opened_at', '0',
    'failure_threshold', ARGV[3],
    'timeout_duration_seconds', ARGV[4])
  state = 'CLOSED'
end

if state == 'CLOSED' then
  redis.call('HSET', key, 'consecutive_failures', '0')
elseif state == 'HALF_OPEN' then
  local successes = redis.call('HINCRBY', key, 'consecutive_successes', 1)
  if successes >= success_threshold then
    redis.call('HSET', key,
      'state', 'CLOSED',
      'consecutive_failures', '0',
      'consecutive_successes', '0',
      'opened_at', '0')
  end
end

redis.call('EXPIRE', key, ttl)
return redis.call('HGET', key, 'state')
"#;

/// Per-identity three-state failure-isolation machine, giving callers a
/// coarser "stop sending to this identity" signal than pool membership.
pub struct CircuitBreakerManager {
    store: Arc<dyn CircuitStore>,
    clock: Arc<dyn Clock>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerManager {
    pub fn new(
        store: Arc<dyn CircuitStore>,
        clock: Arc<dyn Clock>,
        settings: CircuitBreakerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Current circuit state. First access for an unknown identity writes
    /// and returns a fresh CLOSED record with the configured thresholds.
    pub async fn state(&self, id: i64) -> Result<CircuitState> {
        if let Some(state) = self.store.read_circuit(id).await? {
            return Ok(state);
        }
        let fresh = CircuitState::closed(
            self.settings.failure_threshold,
            self.settings.timeout_duration_seconds,
        );
        self.store
            .write_circuit(id, &fresh, self.settings.ttl_seconds)
            .await?;
        debug!(user_agent_id = id, "Initialized circuit breaker (CLOSED)");
        Ok(fresh)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn record_success(&self, id: i64) -> Result<()> {
        self.store
            .record_success(id, self.settings.success_threshold, self.settings.ttl_seconds)
            .await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn record_failure(&self, id: i64) -> Result<()> {
        self.store
            .record_failure(
                id,
                self.settings.failure_threshold,
                self.clock.now_millis(),
                self.settings.ttl_seconds,
            )
            .await
    }

    pub async fn is_open(&self, id: i64) -> Result<bool> {
        Ok(self.state(id).await?.is_open())
    }

    /// Admission check.
    ///
    /// CLOSED always allows. OPEN allows only once the timeout has elapsed,
    /// transitioning to HALF_OPEN on the way. HALF_OPEN admits exactly one
    /// probe: further requests wait until the probe's outcome is recorded.
    pub async fn allow_request(&self, id: i64) -> Result<bool> {
        let state = self.state(id).await?;
        match state.status {
            CircuitStatus::Closed => Ok(true),
            CircuitStatus::Open => {
                if state.open_timeout_elapsed(self.clock.now_millis()) {
                    self.transition_to_half_open(id, &state).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            CircuitStatus::HalfOpen => Ok(state.consecutive_successes == 0),
        }
    }

    /// OPEN -> HALF_OPEN, but only after the open window has elapsed.
    /// Returns whether the transition happened.
    pub async fn try_recover(&self, id: i64) -> Result<bool> {
        let state = self.state(id).await?;
        if state.status != CircuitStatus::Open {
            return Ok(false);
        }
        if !state.open_timeout_elapsed(self.clock.now_millis()) {
            return Ok(false);
        }
        self.transition_to_half_open(id, &state).await?;
        Ok(true)
    }

    /// Manual administrative reset back to CLOSED.
    pub async fn reset(&self, id: i64, reason: &str) -> Result<()> {
        let state = self.state(id).await?;
        let mut closed = state.clone();
        closed.status = CircuitStatus::Closed;
        closed.consecutive_failures = 0;
        closed.consecutive_successes = 0;
        closed.opened_at_millis = None;
        self.store
            .write_circuit(id, &closed, self.settings.ttl_seconds)
            .await?;
        warn!(user_agent_id = id, reason, "Circuit breaker manually reset");
        Ok(())
    }

    async fn transition_to_half_open(&self, id: i64, state: &CircuitState) -> Result<()> {
        let mut half_open = state.clone();
        half_open.status = CircuitStatus::HalfOpen;
        half_open.consecutive_failures = 0;
        half_open.consecutive_successes = 0;
        self.store
            .write_circuit(id, &half_open, self.settings.ttl_seconds)
            .await?;
        info!(user_agent_id = id, "Circuit breaker transitioning to half-open");
        Ok(())
    }
}
