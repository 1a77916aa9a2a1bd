// src/storage/redis.rs

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisConfig, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{info, warn};

use crate::circuit_breaker::{self, circuit_key};
use crate::config::AppConfig;
use crate::error::{PoolError, Result};
use crate::keys::KeyResolver;
use crate::member::{
    codec, Disposition, MemberStatus, PoolMember, PoolStats, ReturnOutcome, SessionCredentials,
};
use crate::rate_limiter::{self, bucket_key};
use crate::scripts::{LegacyPoolScripts, PoolScripts};
use crate::storage::records::{BucketStatus, CircuitState, RateLimitDecision};
use crate::storage::traits::{CircuitStore, PoolStore, RateLimitStore};

/// Redis implementation of the pool, rate-limit and circuit stores.
///
/// All multi-key transitions run as Lua scripts; the maintenance writes that
/// have a single logical writer (session refresh, suspension, restore) run
/// as MULTI/EXEC pipelines. Scripts are registered at construction and the
/// constructor fails if any of them cannot be loaded.
pub struct RedisStore {
    pool: Pool,
    resolver: KeyResolver,
    config: AppConfig,
    scripts: PoolScripts,
    token_bucket: Script,
    update_bucket: Script,
    circuit_failure: Script,
    circuit_success: Script,
}

impl RedisStore {
    /// Creates the connection pool from `config.redis_url` and registers
    /// every script.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let url = config.redis_url.as_deref().ok_or_else(|| {
            PoolError::Config("redis_url is required for the Redis store".into())
        })?;
        let pool = RedisConfig::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        Self::with_pool(pool, config).await
    }

    /// Builds the store over an existing pool and registers every script.
    pub async fn with_pool(pool: Pool, config: &AppConfig) -> Result<Self> {
        let store = Self {
            pool,
            resolver: KeyResolver::new(config.pool.key_prefix.clone()),
            config: config.clone(),
            scripts: PoolScripts::new(),
            token_bucket: Script::new(rate_limiter::TOKEN_BUCKET),
            update_bucket: Script::new(rate_limiter::UPDATE_BUCKET),
            circuit_failure: Script::new(circuit_breaker::RECORD_FAILURE),
            circuit_success: Script::new(circuit_breaker::RECORD_SUCCESS),
        };
        let mut conn = store.connection().await?;
        store.scripts.load(&mut conn).await?;
        crate::scripts::load_script(&mut conn, "token_bucket", rate_limiter::TOKEN_BUCKET).await?;
        crate::scripts::load_script(&mut conn, "update_bucket", rate_limiter::UPDATE_BUCKET)
            .await?;
        crate::scripts::load_script(
            &mut conn,
            "circuit_record_failure",
            circuit_breaker::RECORD_FAILURE,
        )
        .await?;
        crate::scripts::load_script(
            &mut conn,
            "circuit_record_success",
            circuit_breaker::RECORD_SUCCESS,
        )
        .await?;
        info!(
            key_prefix = %store.config.pool.key_prefix,
            "Redis store ready; scripts registered"
        );
        Ok(store)
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub(crate) async fn connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(Into::into)
    }

    fn parse_id(raw: &str) -> Option<i64> {
        match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = %raw, "Non-numeric id in status set; skipping");
                None
            }
        }
    }

    fn outcome_args(&self, outcome: ReturnOutcome) -> (u8, u8) {
        let pool = &self.config.pool;
        match outcome {
            ReturnOutcome::Success => (0, pool.success_health_bonus),
            ReturnOutcome::RateLimited => (1, 0),
            ReturnOutcome::Failure { http_status } => {
                let penalty = if http_status >= 500 {
                    pool.penalty_server_error
                } else {
                    pool.penalty_other
                };
                (2, penalty)
            }
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<i64>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn.smembers(key).await?;
        Ok(raw.iter().filter_map(|s| Self::parse_id(s)).collect())
    }
}

#[async_trait]
impl PoolStore for RedisStore {
    async fn borrow(&self, now_millis: i64) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;
        let selected: Option<String> = self
            .scripts
            .borrow
            .key(self.resolver.idle_set_key())
            .key(self.resolver.member_key_prefix())
            .key(self.resolver.borrowed_set_key())
            .key(self.resolver.session_required_set_key())
            .arg(now_millis)
            .arg(self.config.pool.max_tokens)
            .arg(self.config.pool.window_duration_millis)
            .invoke_async(&mut conn)
            .await?;
        match selected {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| PoolError::ScriptReply {
                    name: "borrow",
                    detail: format!("non-numeric member id '{raw}'"),
                }),
        }
    }

    async fn give_back(
        &self,
        id: i64,
        outcome: ReturnOutcome,
        now_millis: i64,
    ) -> Result<Disposition> {
        let (outcome_code, health_delta) = self.outcome_args(outcome);
        let mut conn = self.connection().await?;
        let code: i64 = self
            .scripts
            .give_back
            .key(self.resolver.borrowed_set_key())
            .key(self.resolver.idle_set_key())
            .key(self.resolver.cooldown_set_key())
            .key(self.resolver.suspended_set_key())
            .key(self.resolver.member_key_prefix())
            .arg(id)
            .arg(outcome_code)
            .arg(now_millis)
            .arg(health_delta)
            .arg(self.config.pool.cooldown_base_millis)
            .arg(self.config.pool.rate_limit_cooldown_threshold)
            .arg(self.config.pool.health_floor)
            .invoke_async(&mut conn)
            .await?;
        match code {
            -1 => Ok(Disposition::NotBorrowed),
            0 => Ok(Disposition::Idle),
            1 => Ok(Disposition::Cooldown),
            2 => Ok(Disposition::Suspended),
            other => Err(PoolError::ScriptReply {
                name: "give_back",
                detail: format!("unexpected disposition code {other}"),
            }),
        }
    }

    async fn recover_cooldowns(&self, now_millis: i64) -> Result<usize> {
        let mut conn = self.connection().await?;
        let recovered: i64 = self
            .scripts
            .cooldown_recover
            .key(self.resolver.cooldown_set_key())
            .key(self.resolver.idle_set_key())
            .key(self.resolver.session_required_set_key())
            .key(self.resolver.member_key_prefix())
            .arg(now_millis)
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered.max(0) as usize)
    }

    async fn insert_member(&self, member: &PoolMember) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.resolver.member_key(member.user_agent_id), &codec::encode(member))
            .ignore();
        pipe.sadd(
            self.resolver.status_set_key(member.status),
            member.user_agent_id,
        )
        .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn read_member(&self, id: i64) -> Result<Option<PoolMember>> {
        let mut conn = self.connection().await?;
        let data: HashMap<String, String> = conn.hgetall(self.resolver.member_key(id)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(codec::decode(&data, self.config.pool.max_tokens)))
    }

    async fn update_session(&self, id: i64, session: &SessionCredentials) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.resolver.member_key(id),
            &[
                ("sessionToken", session.session_token.clone()),
                ("nid", session.nid.clone().unwrap_or_default()),
                ("mustitUid", session.mustit_uid.clone().unwrap_or_default()),
                ("sessionExpiresAt", session.expires_at_millis.to_string()),
                ("status", MemberStatus::Idle.as_str().to_string()),
            ],
        )
        .ignore();
        pipe.srem(self.resolver.session_required_set_key(), id).ignore();
        pipe.sadd(self.resolver.idle_set_key(), id).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn expire_session(&self, id: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.resolver.member_key(id),
            &[
                ("sessionToken", String::new()),
                ("nid", String::new()),
                ("mustitUid", String::new()),
                ("sessionExpiresAt", "0".to_string()),
                ("status", MemberStatus::SessionRequired.as_str().to_string()),
            ],
        )
        .ignore();
        pipe.srem(self.resolver.idle_set_key(), id).ignore();
        pipe.srem(self.resolver.borrowed_set_key(), id).ignore();
        pipe.srem(self.resolver.cooldown_set_key(), id).ignore();
        pipe.sadd(self.resolver.session_required_set_key(), id).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn suspend(&self, id: i64, now_millis: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.resolver.member_key(id),
            &[
                ("status", MemberStatus::Suspended.as_str().to_string()),
                ("suspendedAt", now_millis.to_string()),
                ("sessionToken", String::new()),
                ("nid", String::new()),
                ("mustitUid", String::new()),
                ("sessionExpiresAt", "0".to_string()),
            ],
        )
        .ignore();
        for set in [
            self.resolver.idle_set_key(),
            self.resolver.borrowed_set_key(),
            self.resolver.cooldown_set_key(),
            self.resolver.session_required_set_key(),
        ] {
            pipe.srem(set, id).ignore();
        }
        pipe.sadd(self.resolver.suspended_set_key(), id).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn restore(&self, id: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            self.resolver.member_key(id),
            &[
                ("status", MemberStatus::SessionRequired.as_str().to_string()),
                ("healthScore", "70".to_string()),
                (
                    "remainingTokens",
                    self.config.pool.max_tokens.to_string(),
                ),
                ("sessionToken", String::new()),
                ("nid", String::new()),
                ("mustitUid", String::new()),
                ("sessionExpiresAt", "0".to_string()),
                ("windowStart", "0".to_string()),
                ("windowEnd", "0".to_string()),
                ("suspendedAt", "0".to_string()),
                ("borrowedAt", "0".to_string()),
                ("cooldownUntil", "0".to_string()),
                ("consecutiveRateLimits", "0".to_string()),
            ],
        )
        .ignore();
        pipe.srem(self.resolver.suspended_set_key(), id).ignore();
        pipe.sadd(self.resolver.session_required_set_key(), id).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_health(&self, id: i64, score: u8) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(
                self.resolver.member_key(id),
                "healthScore",
                score.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn members_in(&self, status: MemberStatus) -> Result<Vec<i64>> {
        self.set_members(&self.resolver.status_set_key(status)).await
    }

    async fn pool_stats(&self) -> Result<PoolStats> {
        let mut conn = self.connection().await?;
        let [idle_key, borrowed_key, cooldown_key, session_required_key, suspended_key] =
            self.resolver.all_status_set_keys();

        let idle: usize = conn.scard(&idle_key).await?;
        let borrowed: usize = conn.scard(&borrowed_key).await?;
        let cooldown: usize = conn.scard(&cooldown_key).await?;
        let session_required: usize = conn.scard(&session_required_key).await?;
        let suspended: usize = conn.scard(&suspended_key).await?;

        let idle_ids: Vec<String> = conn.smembers(&idle_key).await?;
        let mut health_min = 100u8;
        let mut health_max = 0u8;
        let mut health_sum = 0u64;
        let mut counted = 0usize;
        for id in &idle_ids {
            let health: Option<String> = conn
                .hget(format!("{}{}", self.resolver.member_key_prefix(), id), "healthScore")
                .await?;
            if let Some(health) = health.and_then(|h| h.parse::<u8>().ok()) {
                health_min = health_min.min(health);
                health_max = health_max.max(health);
                health_sum += u64::from(health);
                counted += 1;
            }
        }

        Ok(PoolStats {
            total: idle + borrowed + cooldown + session_required + suspended,
            idle,
            borrowed,
            cooldown,
            session_required,
            suspended,
            health_min: if counted > 0 { health_min } else { 0 },
            health_avg: if counted > 0 {
                health_sum as f64 / counted as f64
            } else {
                0.0
            },
            health_max: if counted > 0 { health_max } else { 0 },
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut hash_keys = Vec::new();
        for set in self.resolver.all_status_set_keys() {
            let ids: Vec<String> = conn.smembers(&set).await?;
            for id in ids {
                hash_keys.push(format!("{}{}", self.resolver.member_key_prefix(), id));
            }
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !hash_keys.is_empty() {
            pipe.del(hash_keys).ignore();
        }
        pipe.del(self.resolver.all_status_set_keys().to_vec()).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        info!("Pool keyspace cleared");
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn try_consume(
        &self,
        id: i64,
        tokens: u32,
        refill_rate: f64,
        max_tokens: u32,
        ttl_seconds: i64,
        now_millis: i64,
    ) -> Result<RateLimitDecision> {
        let mut conn = self.connection().await?;
        let (allowed, tokens_str, retry_after): (i64, String, i64) = self
            .token_bucket
            .key(bucket_key(id))
            .arg(tokens)
            .arg(now_millis)
            .arg(refill_rate)
            .arg(max_tokens)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await?;
        let current_tokens = tokens_str.parse().map_err(|_| PoolError::ScriptReply {
            name: "token_bucket",
            detail: format!("non-numeric token count '{tokens_str}'"),
        })?;
        Ok(RateLimitDecision {
            allowed: allowed == 1,
            current_tokens,
            retry_after_millis: retry_after,
        })
    }

    async fn bucket_status(&self, id: i64) -> Result<Option<BucketStatus>> {
        let mut conn = self.connection().await?;
        let data: HashMap<String, String> = conn.hgetall(bucket_key(id)).await?;
        let Some(tokens) = data.get("tokens").and_then(|v| v.parse().ok()) else {
            return Ok(None);
        };
        Ok(Some(BucketStatus {
            tokens,
            last_refill_millis: data
                .get("last_refill_timestamp")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_tokens: data
                .get("max_tokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.rate_limiter.max_tokens),
            refill_rate: data
                .get("refill_rate")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.rate_limiter.refill_rate),
        }))
    }

    async fn update_bucket(&self, id: i64, max_tokens: u32, refill_rate: f64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .update_bucket
            .key(bucket_key(id))
            .arg(max_tokens)
            .arg(refill_rate)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(self.config.rate_limiter.bucket_ttl_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_bucket(&self, id: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(bucket_key(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl CircuitStore for RedisStore {
    async fn record_failure(
        &self,
        id: i64,
        failure_threshold: u32,
        now_millis: i64,
        ttl_seconds: i64,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .circuit_failure
            .key(circuit_key(id))
            .arg(failure_threshold)
            .arg(now_millis)
            .arg(ttl_seconds)
            .arg(self.config.circuit_breaker.timeout_duration_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        id: i64,
        success_threshold: u32,
        ttl_seconds: i64,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .circuit_success
            .key(circuit_key(id))
            .arg(success_threshold)
            .arg(ttl_seconds)
            .arg(self.config.circuit_breaker.failure_threshold)
            .arg(self.config.circuit_breaker.timeout_duration_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_circuit(&self, id: i64) -> Result<Option<CircuitState>> {
        let mut conn = self.connection().await?;
        let data: HashMap<String, String> = conn.hgetall(circuit_key(id)).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(CircuitState::decode(
            &data,
            self.config.circuit_breaker.failure_threshold,
            self.config.circuit_breaker.timeout_duration_seconds,
        )))
    }

    async fn write_circuit(&self, id: i64, state: &CircuitState, ttl_seconds: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(circuit_key(id), &state.encode()).ignore();
        pipe.expire(circuit_key(id), ttl_seconds).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Superseded script generation behind the same [`PoolStore`] interface,
/// kept selectable during the migration window. Selection happens once at
/// construction; there are no generation branches inside any method.
///
/// Differences from the current generation: selection debits the window
/// counter in place over the legacy `ready` set (which aliases `idle`)
/// without a borrowed set, so `give_back` can never observe `NotBorrowed`
/// and cooldown recovery has nothing to do.
pub struct LegacyRedisStore {
    inner: RedisStore,
    scripts: LegacyPoolScripts,
}

impl LegacyRedisStore {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let inner = RedisStore::connect(config).await?;
        Self::wrap(inner).await
    }

    pub async fn with_pool(pool: Pool, config: &AppConfig) -> Result<Self> {
        let inner = RedisStore::with_pool(pool, config).await?;
        Self::wrap(inner).await
    }

    async fn wrap(inner: RedisStore) -> Result<Self> {
        let scripts = LegacyPoolScripts::new();
        let mut conn = inner.connection().await?;
        scripts.load(&mut conn).await?;
        warn!("Legacy pool script generation selected");
        Ok(Self { inner, scripts })
    }
}

#[async_trait]
impl PoolStore for LegacyRedisStore {
    async fn borrow(&self, now_millis: i64) -> Result<Option<i64>> {
        let mut conn = self.inner.connection().await?;
        let selected: Option<String> = self
            .scripts
            .consume_token
            .key(self.inner.resolver.ready_set_key())
            .key(self.inner.resolver.member_key_prefix())
            .key(self.inner.resolver.session_required_set_key())
            .arg(now_millis)
            .arg(self.inner.config.pool.max_tokens)
            .arg(self.inner.config.pool.window_duration_millis)
            .invoke_async(&mut conn)
            .await?;
        match selected {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| PoolError::ScriptReply {
                    name: "consume_token",
                    detail: format!("non-numeric member id '{raw}'"),
                }),
        }
    }

    async fn give_back(
        &self,
        id: i64,
        outcome: ReturnOutcome,
        now_millis: i64,
    ) -> Result<Disposition> {
        let mut conn = self.inner.connection().await?;
        match outcome {
            ReturnOutcome::Success => {
                let _: i64 = self
                    .scripts
                    .record_success
                    .key(self.inner.resolver.member_key(id))
                    .arg(self.inner.config.pool.success_health_bonus)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(Disposition::Idle)
            }
            ReturnOutcome::RateLimited | ReturnOutcome::Failure { .. } => {
                let penalty = match outcome {
                    ReturnOutcome::Failure { http_status } if http_status >= 500 => {
                        self.inner.config.pool.penalty_server_error
                    }
                    _ => self.inner.config.pool.penalty_other,
                };
                let suspended: i64 = self
                    .scripts
                    .record_failure
                    .key(self.inner.resolver.member_key(id))
                    .key(self.inner.resolver.ready_set_key())
                    .key(self.inner.resolver.suspended_set_key())
                    .arg(penalty)
                    .arg(self.inner.config.pool.health_floor)
                    .arg(id)
                    .arg(now_millis)
                    .invoke_async(&mut conn)
                    .await?;
                if suspended == 1 {
                    Ok(Disposition::Suspended)
                } else {
                    Ok(Disposition::Idle)
                }
            }
        }
    }

    async fn recover_cooldowns(&self, _now_millis: i64) -> Result<usize> {
        // The legacy generation has no cooldown state.
        Ok(0)
    }

    async fn insert_member(&self, member: &PoolMember) -> Result<()> {
        self.inner.insert_member(member).await
    }

    async fn read_member(&self, id: i64) -> Result<Option<PoolMember>> {
        self.inner.read_member(id).await
    }

    async fn update_session(&self, id: i64, session: &SessionCredentials) -> Result<()> {
        self.inner.update_session(id, session).await
    }

    async fn expire_session(&self, id: i64) -> Result<()> {
        self.inner.expire_session(id).await
    }

    async fn suspend(&self, id: i64, now_millis: i64) -> Result<()> {
        self.inner.suspend(id, now_millis).await
    }

    async fn restore(&self, id: i64) -> Result<()> {
        self.inner.restore(id).await
    }

    async fn set_health(&self, id: i64, score: u8) -> Result<()> {
        self.inner.set_health(id, score).await
    }

    async fn members_in(&self, status: MemberStatus) -> Result<Vec<i64>> {
        self.inner.members_in(status).await
    }

    async fn pool_stats(&self) -> Result<PoolStats> {
        self.inner.pool_stats().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}
