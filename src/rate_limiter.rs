// src/rate_limiter.rs

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::config::RateLimiterSettings;
use crate::error::Result;
use crate::storage::records::{BucketStatus, RateLimitDecision};
use crate::storage::traits::RateLimitStore;

/// Bucket key namespace, fixed and independent of the pool prefix.
pub fn bucket_key(id: i64) -> String {
    format!("rate_limit:bucket:{id}")
}

/// Lazy-refill token bucket consume. Refills `min(max, tokens +
/// elapsed * rate)` from the stored `last_refill_timestamp`, then debits or
/// denies. Tokens are returned as a string to survive the integer-only Lua
/// number reply conversion.
///
/// KEYS: bucket key. ARGV: tokens_to_consume, now_ms, refill_rate,
/// max_tokens, ttl_seconds. Reply: {allowed, tokens_str, retry_after_ms}.
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local requested = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local max_tokens = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local vals = redis.call('HMGET', key, 'tokens', 'last_refill_timestamp')
local tokens = tonumber(vals[1])
local last_refill = tonumber(vals[2])

if tokens == nil then
  tokens = max_tokens
  last_refill = now
end

local elapsed = now - last_refill
if elapsed > 0 then
  tokens = math.min(max_tokens, tokens + (elapsed / 1000.0) * rate)
end

local allowed = 0
local retry_after = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
else
  retry_after = math.ceil((requested - tokens) / rate * 1000)
end

redis.call('HSET', key,
  'tokens', tostring(tokens),
  'last_refill_timestamp', tostring(now),
  'max_tokens', tostring(max_tokens),
  'refill_rate', tostring(rate))
redis.call('EXPIRE', key, ttl)

return {allowed, tostring(tokens), retry_after}
"#;

/// Reconfigures a bucket's ceiling and rate. The stored count is rescaled
/// proportionally to the ceiling change and clamped, so a reconfiguration
/// can never instantaneously grant tokens beyond the new ceiling. A missing
/// bucket is initialized full at the new ceiling.
///
/// KEYS: bucket key. ARGV: new_max_tokens, new_refill_rate, now_ms,
/// ttl_seconds.
pub const UPDATE_BUCKET: &str = r#"
local key = KEYS[1]
local new_max = tonumber(ARGV[1])
local new_rate = tonumber(ARGV[2])
local now = ARGV[3]
local ttl = tonumber(ARGV[4])

local vals = redis.call('HMGET', key, 'tokens', 'max_tokens')
local tokens = tonumber(vals[1])
local old_max = tonumber(vals[2])

if tokens == nil or old_max == nil or old_max <= 0 then
  tokens = new_max
  redis.call('HSET', key, 'last_refill_timestamp', now)
else
  tokens = math.min(new_max, tokens * new_max / old_max)
end

redis.call('HSET', key,
  'tokens', tostring(tokens),
  'max_tokens', tostring(new_max),
  'refill_rate', tostring(new_rate))
redis.call('EXPIRE', key, ttl)
return tostring(tokens)
"#;

/// Per-identity distributed rate limiter.
///
/// Independent of the member's own status machine: a borrowed member can
/// still be denied a token here. No background refill; every consume
/// recomputes from elapsed time.
pub struct TokenBucketRateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    settings: RateLimiterSettings,
}

impl TokenBucketRateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        settings: RateLimiterSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Consumes the configured per-request token count.
    pub async fn try_consume(&self, id: i64) -> Result<RateLimitDecision> {
        self.try_consume_tokens(id, self.settings.tokens_per_request)
            .await
    }

    /// Consumes `tokens` tokens from the identity's bucket.
    #[instrument(level = "debug", skip(self))]
    pub async fn try_consume_tokens(&self, id: i64, tokens: u32) -> Result<RateLimitDecision> {
        let decision = self
            .store
            .try_consume(
                id,
                tokens,
                self.settings.refill_rate,
                self.settings.max_tokens,
                self.settings.bucket_ttl_seconds,
                self.clock.now_millis(),
            )
            .await?;
        if !decision.allowed {
            debug!(
                user_agent_id = id,
                tokens = decision.current_tokens,
                retry_after_ms = decision.retry_after_millis,
                "Rate limit denied"
            );
        }
        Ok(decision)
    }

    /// Convenience predicate over [`Self::try_consume`].
    pub async fn allow(&self, id: i64) -> Result<bool> {
        Ok(self.try_consume(id).await?.allowed)
    }

    /// Milliseconds until one request's worth of tokens is available,
    /// without consuming anything.
    pub async fn wait_time(&self, id: i64) -> Result<i64> {
        self.wait_time_for(id, self.settings.tokens_per_request)
            .await
    }

    /// Milliseconds until `tokens` tokens are available. Recomputes the
    /// same refill projection the consume script uses, capped at the
    /// configured maximum wait. A missing bucket is immediately usable.
    pub async fn wait_time_for(&self, id: i64, tokens: u32) -> Result<i64> {
        let Some(status) = self.store.bucket_status(id).await? else {
            return Ok(0);
        };

        let now = self.clock.now_millis();
        let elapsed_seconds = (now - status.last_refill_millis).max(0) as f64 / 1000.0;
        let refilled = (status.tokens + elapsed_seconds * status.refill_rate)
            .min(f64::from(status.max_tokens));

        let required = f64::from(tokens);
        if refilled >= required {
            return Ok(0);
        }

        let shortage = required - refilled;
        let wait_millis = (shortage / status.refill_rate * 1000.0).ceil() as i64;
        Ok(wait_millis.min(self.settings.max_wait_millis))
    }

    pub async fn bucket_status(&self, id: i64) -> Result<Option<BucketStatus>> {
        self.store.bucket_status(id).await
    }

    /// Dynamically rescales an identity's bucket.
    #[instrument(level = "debug", skip(self))]
    pub async fn update_bucket(&self, id: i64, max_tokens: u32, refill_rate: f64) -> Result<()> {
        self.store.update_bucket(id, max_tokens, refill_rate).await
    }

    /// Drops an identity's bucket, e.g. when it leaves rotation for good.
    pub async fn delete_bucket(&self, id: i64) -> Result<()> {
        self.store.delete_bucket(id).await
    }
}
