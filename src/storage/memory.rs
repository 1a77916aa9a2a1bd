// src/storage/memory.rs

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::circuit_breaker::circuit_key;
use crate::config::{AppConfig, ScriptGeneration};
use crate::error::Result;
use crate::keys::KeyResolver;
use crate::member::{
    codec, Disposition, MemberStatus, PoolMember, PoolStats, ReturnOutcome, SessionCredentials,
};
use crate::rate_limiter::bucket_key;
use crate::storage::records::{BucketStatus, CircuitState, CircuitStatus, RateLimitDecision};
use crate::storage::traits::{CircuitStore, PoolStore, RateLimitStore};

/// String keyspace shaped like the Redis layout: hashes and sets addressed
/// by the same keys the [`KeyResolver`] produces.
#[derive(Default)]
struct KeySpace {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl KeySpace {
    fn hset(&mut self, key: &str, fields: &[(&str, String)]) {
        let hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
    }

    fn hget(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key)?.get(field)
    }

    fn sadd(&mut self, key: &str, member: i64) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: i64) -> bool {
        self.sets
            .get_mut(key)
            .is_some_and(|set| set.remove(&member.to_string()))
    }

    fn smembers(&self, key: &str) -> Vec<i64> {
        self.sets
            .get(key)
            .map(|set| set.iter().filter_map(|raw| raw.parse().ok()).collect())
            .unwrap_or_default()
    }

    fn scard(&self, key: &str) -> usize {
        self.sets.get(key).map_or(0, BTreeSet::len)
    }
}

/// In-memory implementation of the three store seams.
///
/// One mutex guards the whole keyspace, giving every multi-key transition
/// the same atomicity the Lua scripts give the Redis store. The stored
/// representation is the encoded string form, so the codec and key layout
/// are exercised on every operation. Key TTLs are not modeled; nothing here
/// depends on expiry for correctness.
///
/// Like the Redis path, the store honors `pool.script_generation`: under
/// `Legacy` the selection debits the window counter in place over the ready
/// set without a borrowed set, returns never report `NotBorrowed`, and
/// cooldown recovery has nothing to do.
pub struct MemoryStore {
    space: Mutex<KeySpace>,
    resolver: KeyResolver,
    config: AppConfig,
    generation: ScriptGeneration,
}

impl MemoryStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            space: Mutex::new(KeySpace::default()),
            resolver: KeyResolver::new(config.pool.key_prefix.clone()),
            config: config.clone(),
            generation: config.pool.script_generation,
        }
    }

    fn session_valid(space: &KeySpace, member_key: &str, now_millis: i64) -> bool {
        let token = space.hget(member_key, "sessionToken");
        let expires_at: i64 = space
            .hget(member_key, "sessionExpiresAt")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        token.is_some_and(|t| !t.is_empty()) && expires_at > now_millis
    }

    fn clear_session_fields(space: &mut KeySpace, member_key: &str) {
        space.hset(
            member_key,
            &[
                ("sessionToken", String::new()),
                ("nid", String::new()),
                ("mustitUid", String::new()),
                ("sessionExpiresAt", "0".to_string()),
            ],
        );
    }

    fn demote_to_session_required(&self, space: &mut KeySpace, id: i64, from_set: &str) {
        space.srem(from_set, id);
        space.sadd(&self.resolver.session_required_set_key(), id);
        let member_key = self.resolver.member_key(id);
        space.hset(
            &member_key,
            &[("status", MemberStatus::SessionRequired.as_str().to_string())],
        );
        Self::clear_session_fields(space, &member_key);
    }

    /// Superseded selection: debits the window counter in place, leaving the
    /// member in the ready set.
    async fn borrow_legacy(&self, now_millis: i64) -> Result<Option<i64>> {
        let mut space = self.space.lock().await;
        let ready_key = self.resolver.ready_set_key();
        let max_tokens = self.config.pool.max_tokens;

        for id in space.smembers(&ready_key) {
            let member_key = self.resolver.member_key(id);

            if !Self::session_valid(&space, &member_key, now_millis) {
                self.demote_to_session_required(&mut space, id, &ready_key);
                continue;
            }

            let mut remaining: u32 = space
                .hget(&member_key, "remainingTokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(max_tokens);
            let window_end: i64 = space
                .hget(&member_key, "windowEnd")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            if window_end <= now_millis {
                remaining = max_tokens;
                space.hset(
                    &member_key,
                    &[
                        ("windowStart", now_millis.to_string()),
                        (
                            "windowEnd",
                            (now_millis + self.config.pool.window_duration_millis).to_string(),
                        ),
                    ],
                );
            }

            if remaining == 0 {
                continue;
            }

            space.hset(
                &member_key,
                &[("remainingTokens", (remaining - 1).to_string())],
            );
            return Ok(Some(id));
        }

        Ok(None)
    }

    /// Superseded return: health bookkeeping only, no borrowed-set guard.
    /// Success resets the throttle streak; failures of any kind take the
    /// penalty and suspend below the floor.
    async fn give_back_legacy(
        &self,
        id: i64,
        outcome: ReturnOutcome,
        now_millis: i64,
    ) -> Result<Disposition> {
        let mut space = self.space.lock().await;
        let member_key = self.resolver.member_key(id);
        let health: u8 = space
            .hget(&member_key, "healthScore")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let pool = &self.config.pool;

        match outcome {
            ReturnOutcome::Success => {
                let health = health.saturating_add(pool.success_health_bonus).min(100);
                space.hset(
                    &member_key,
                    &[
                        ("healthScore", health.to_string()),
                        ("consecutiveRateLimits", "0".to_string()),
                    ],
                );
                Ok(Disposition::Idle)
            }
            ReturnOutcome::RateLimited | ReturnOutcome::Failure { .. } => {
                let penalty = match outcome {
                    ReturnOutcome::Failure { http_status } if http_status >= 500 => {
                        pool.penalty_server_error
                    }
                    _ => pool.penalty_other,
                };
                let health = health.saturating_sub(penalty);
                space.hset(&member_key, &[("healthScore", health.to_string())]);
                if health < pool.health_floor {
                    space.hset(
                        &member_key,
                        &[
                            ("status", MemberStatus::Suspended.as_str().to_string()),
                            ("suspendedAt", now_millis.to_string()),
                        ],
                    );
                    Self::clear_session_fields(&mut space, &member_key);
                    space.srem(&self.resolver.ready_set_key(), id);
                    space.sadd(&self.resolver.suspended_set_key(), id);
                    Ok(Disposition::Suspended)
                } else {
                    Ok(Disposition::Idle)
                }
            }
        }
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn borrow(&self, now_millis: i64) -> Result<Option<i64>> {
        if self.generation == ScriptGeneration::Legacy {
            return self.borrow_legacy(now_millis).await;
        }
        let mut space = self.space.lock().await;
        let idle_key = self.resolver.idle_set_key();
        let max_tokens = self.config.pool.max_tokens;

        for id in space.smembers(&idle_key) {
            let member_key = self.resolver.member_key(id);

            if !Self::session_valid(&space, &member_key, now_millis) {
                self.demote_to_session_required(&mut space, id, &idle_key);
                continue;
            }

            let mut remaining: u32 = space
                .hget(&member_key, "remainingTokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(max_tokens);
            let window_end: i64 = space
                .hget(&member_key, "windowEnd")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            if window_end <= now_millis {
                remaining = max_tokens;
                space.hset(
                    &member_key,
                    &[
                        ("windowStart", now_millis.to_string()),
                        (
                            "windowEnd",
                            (now_millis + self.config.pool.window_duration_millis).to_string(),
                        ),
                    ],
                );
            }

            if remaining == 0 {
                continue;
            }

            space.hset(
                &member_key,
                &[
                    ("remainingTokens", (remaining - 1).to_string()),
                    ("status", MemberStatus::Borrowed.as_str().to_string()),
                    ("borrowedAt", now_millis.to_string()),
                ],
            );
            space.srem(&idle_key, id);
            space.sadd(&self.resolver.borrowed_set_key(), id);
            return Ok(Some(id));
        }

        Ok(None)
    }

    async fn give_back(
        &self,
        id: i64,
        outcome: ReturnOutcome,
        now_millis: i64,
    ) -> Result<Disposition> {
        if self.generation == ScriptGeneration::Legacy {
            return self.give_back_legacy(id, outcome, now_millis).await;
        }
        let mut space = self.space.lock().await;
        if !space.srem(&self.resolver.borrowed_set_key(), id) {
            return Ok(Disposition::NotBorrowed);
        }

        let member_key = self.resolver.member_key(id);
        space.hset(&member_key, &[("borrowedAt", "0".to_string())]);
        let health: u8 = space
            .hget(&member_key, "healthScore")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let pool = &self.config.pool;

        match outcome {
            ReturnOutcome::Success => {
                let health = health.saturating_add(pool.success_health_bonus).min(100);
                space.hset(
                    &member_key,
                    &[
                        ("healthScore", health.to_string()),
                        ("consecutiveRateLimits", "0".to_string()),
                        ("status", MemberStatus::Idle.as_str().to_string()),
                    ],
                );
                space.sadd(&self.resolver.idle_set_key(), id);
                Ok(Disposition::Idle)
            }
            ReturnOutcome::RateLimited => {
                let streak: u32 = space
                    .hget(&member_key, "consecutiveRateLimits")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
                    + 1;
                space.hset(
                    &member_key,
                    &[("consecutiveRateLimits", streak.to_string())],
                );
                if streak >= pool.rate_limit_cooldown_threshold {
                    let until = now_millis + pool.cooldown_base_millis * i64::from(streak);
                    space.hset(
                        &member_key,
                        &[
                            ("status", MemberStatus::Cooldown.as_str().to_string()),
                            ("cooldownUntil", until.to_string()),
                        ],
                    );
                    space.sadd(&self.resolver.cooldown_set_key(), id);
                    Ok(Disposition::Cooldown)
                } else {
                    space.hset(
                        &member_key,
                        &[("status", MemberStatus::Idle.as_str().to_string())],
                    );
                    space.sadd(&self.resolver.idle_set_key(), id);
                    Ok(Disposition::Idle)
                }
            }
            ReturnOutcome::Failure { http_status } => {
                let penalty = if http_status >= 500 {
                    pool.penalty_server_error
                } else {
                    pool.penalty_other
                };
                let health = health.saturating_sub(penalty);
                space.hset(
                    &member_key,
                    &[
                        ("healthScore", health.to_string()),
                        ("consecutiveRateLimits", "0".to_string()),
                    ],
                );
                if health < pool.health_floor {
                    space.hset(
                        &member_key,
                        &[
                            ("status", MemberStatus::Suspended.as_str().to_string()),
                            ("suspendedAt", now_millis.to_string()),
                        ],
                    );
                    Self::clear_session_fields(&mut space, &member_key);
                    space.sadd(&self.resolver.suspended_set_key(), id);
                    Ok(Disposition::Suspended)
                } else {
                    space.hset(
                        &member_key,
                        &[("status", MemberStatus::Idle.as_str().to_string())],
                    );
                    space.sadd(&self.resolver.idle_set_key(), id);
                    Ok(Disposition::Idle)
                }
            }
        }
    }

    async fn recover_cooldowns(&self, now_millis: i64) -> Result<usize> {
        if self.generation == ScriptGeneration::Legacy {
            // The legacy generation has no cooldown state.
            return Ok(0);
        }
        let mut space = self.space.lock().await;
        let cooldown_key = self.resolver.cooldown_set_key();
        let mut recovered = 0;

        for id in space.smembers(&cooldown_key) {
            let member_key = self.resolver.member_key(id);
            let until: i64 = space
                .hget(&member_key, "cooldownUntil")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if until == 0 || until > now_millis {
                continue;
            }

            space.srem(&cooldown_key, id);
            space.hset(&member_key, &[("cooldownUntil", "0".to_string())]);
            if Self::session_valid(&space, &member_key, now_millis) {
                space.hset(
                    &member_key,
                    &[("status", MemberStatus::Idle.as_str().to_string())],
                );
                space.sadd(&self.resolver.idle_set_key(), id);
            } else {
                space.hset(
                    &member_key,
                    &[("status", MemberStatus::SessionRequired.as_str().to_string())],
                );
                Self::clear_session_fields(&mut space, &member_key);
                space.sadd(&self.resolver.session_required_set_key(), id);
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn insert_member(&self, member: &PoolMember) -> Result<()> {
        let mut space = self.space.lock().await;
        space.hset(
            &self.resolver.member_key(member.user_agent_id),
            &codec::encode(member),
        );
        space.sadd(
            &self.resolver.status_set_key(member.status),
            member.user_agent_id,
        );
        Ok(())
    }

    async fn read_member(&self, id: i64) -> Result<Option<PoolMember>> {
        let space = self.space.lock().await;
        Ok(space
            .hashes
            .get(&self.resolver.member_key(id))
            .map(|hash| codec::decode(hash, self.config.pool.max_tokens)))
    }

    async fn update_session(&self, id: i64, session: &SessionCredentials) -> Result<()> {
        let mut space = self.space.lock().await;
        space.hset(
            &self.resolver.member_key(id),
            &[
                ("sessionToken", session.session_token.clone()),
                ("nid", session.nid.clone().unwrap_or_default()),
                ("mustitUid", session.mustit_uid.clone().unwrap_or_default()),
                ("sessionExpiresAt", session.expires_at_millis.to_string()),
                ("status", MemberStatus::Idle.as_str().to_string()),
            ],
        );
        space.srem(&self.resolver.session_required_set_key(), id);
        space.sadd(&self.resolver.idle_set_key(), id);
        Ok(())
    }

    async fn expire_session(&self, id: i64) -> Result<()> {
        let mut space = self.space.lock().await;
        let member_key = self.resolver.member_key(id);
        Self::clear_session_fields(&mut space, &member_key);
        space.hset(
            &member_key,
            &[("status", MemberStatus::SessionRequired.as_str().to_string())],
        );
        space.srem(&self.resolver.idle_set_key(), id);
        space.srem(&self.resolver.borrowed_set_key(), id);
        space.srem(&self.resolver.cooldown_set_key(), id);
        space.sadd(&self.resolver.session_required_set_key(), id);
        Ok(())
    }

    async fn suspend(&self, id: i64, now_millis: i64) -> Result<()> {
        let mut space = self.space.lock().await;
        let member_key = self.resolver.member_key(id);
        space.hset(
            &member_key,
            &[
                ("status", MemberStatus::Suspended.as_str().to_string()),
                ("suspendedAt", now_millis.to_string()),
            ],
        );
        Self::clear_session_fields(&mut space, &member_key);
        for set in [
            self.resolver.idle_set_key(),
            self.resolver.borrowed_set_key(),
            self.resolver.cooldown_set_key(),
            self.resolver.session_required_set_key(),
        ] {
            space.srem(&set, id);
        }
        space.sadd(&self.resolver.suspended_set_key(), id);
        Ok(())
    }

    async fn restore(&self, id: i64) -> Result<()> {
        let mut space = self.space.lock().await;
        let member_key = self.resolver.member_key(id);
        space.hset(
            &member_key,
            &[
                ("status", MemberStatus::SessionRequired.as_str().to_string()),
                ("healthScore", "70".to_string()),
                ("remainingTokens", self.config.pool.max_tokens.to_string()),
                ("windowStart", "0".to_string()),
                ("windowEnd", "0".to_string()),
                ("suspendedAt", "0".to_string()),
                ("borrowedAt", "0".to_string()),
                ("cooldownUntil", "0".to_string()),
                ("consecutiveRateLimits", "0".to_string()),
            ],
        );
        Self::clear_session_fields(&mut space, &member_key);
        space.srem(&self.resolver.suspended_set_key(), id);
        space.sadd(&self.resolver.session_required_set_key(), id);
        Ok(())
    }

    async fn set_health(&self, id: i64, score: u8) -> Result<()> {
        let mut space = self.space.lock().await;
        space.hset(
            &self.resolver.member_key(id),
            &[("healthScore", score.to_string())],
        );
        Ok(())
    }

    async fn members_in(&self, status: MemberStatus) -> Result<Vec<i64>> {
        let space = self.space.lock().await;
        Ok(space.smembers(&self.resolver.status_set_key(status)))
    }

    async fn pool_stats(&self) -> Result<PoolStats> {
        let space = self.space.lock().await;
        let idle = space.scard(&self.resolver.idle_set_key());
        let borrowed = space.scard(&self.resolver.borrowed_set_key());
        let cooldown = space.scard(&self.resolver.cooldown_set_key());
        let session_required = space.scard(&self.resolver.session_required_set_key());
        let suspended = space.scard(&self.resolver.suspended_set_key());

        let mut health_min = 100u8;
        let mut health_max = 0u8;
        let mut health_sum = 0u64;
        let mut counted = 0usize;
        for id in space.smembers(&self.resolver.idle_set_key()) {
            let health = space
                .hget(&self.resolver.member_key(id), "healthScore")
                .and_then(|v| v.parse::<u8>().ok());
            if let Some(health) = health {
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
        let mut space = self.space.lock().await;
        for set in self.resolver.all_status_set_keys() {
            for id in space.smembers(&set) {
                space.hashes.remove(&self.resolver.member_key(id));
            }
            space.sets.remove(&set);
        }
        info!("Pool keyspace cleared");
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn try_consume(
        &self,
        id: i64,
        tokens: u32,
        refill_rate: f64,
        max_tokens: u32,
        _ttl_seconds: i64,
        now_millis: i64,
    ) -> Result<RateLimitDecision> {
        let mut space = self.space.lock().await;
        let key = bucket_key(id);

        let (mut current, last_refill) = match space.hget(&key, "tokens") {
            Some(raw) => (
                raw.parse().unwrap_or(f64::from(max_tokens)),
                space
                    .hget(&key, "last_refill_timestamp")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(now_millis),
            ),
            None => (f64::from(max_tokens), now_millis),
        };

        let elapsed = now_millis - last_refill;
        if elapsed > 0 {
            current = (current + (elapsed as f64 / 1000.0) * refill_rate)
                .min(f64::from(max_tokens));
        }

        let requested = f64::from(tokens);
        let (allowed, retry_after_millis) = if current >= requested {
            current -= requested;
            (true, 0)
        } else {
            (false, ((requested - current) / refill_rate * 1000.0).ceil() as i64)
        };

        space.hset(
            &key,
            &[
                ("tokens", current.to_string()),
                ("last_refill_timestamp", now_millis.to_string()),
                ("max_tokens", max_tokens.to_string()),
                ("refill_rate", refill_rate.to_string()),
            ],
        );

        Ok(RateLimitDecision {
            allowed,
            current_tokens: current,
            retry_after_millis,
        })
    }

    async fn bucket_status(&self, id: i64) -> Result<Option<BucketStatus>> {
        let space = self.space.lock().await;
        let key = bucket_key(id);
        let Some(tokens) = space.hget(&key, "tokens").and_then(|v| v.parse().ok()) else {
            return Ok(None);
        };
        Ok(Some(BucketStatus {
            tokens,
            last_refill_millis: space
                .hget(&key, "last_refill_timestamp")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_tokens: space
                .hget(&key, "max_tokens")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.rate_limiter.max_tokens),
            refill_rate: space
                .hget(&key, "refill_rate")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.rate_limiter.refill_rate),
        }))
    }

    async fn update_bucket(&self, id: i64, max_tokens: u32, refill_rate: f64) -> Result<()> {
        let mut space = self.space.lock().await;
        let key = bucket_key(id);

        let tokens = space.hget(&key, "tokens").and_then(|v| v.parse::<f64>().ok());
        let old_max = space
            .hget(&key, "max_tokens")
            .and_then(|v| v.parse::<f64>().ok());

        let rescaled = match (tokens, old_max) {
            (Some(tokens), Some(old_max)) if old_max > 0.0 => {
                (tokens * f64::from(max_tokens) / old_max).min(f64::from(max_tokens))
            }
            _ => {
                space.hset(
                    &key,
                    &[(
                        "last_refill_timestamp",
                        chrono::Utc::now().timestamp_millis().to_string(),
                    )],
                );
                f64::from(max_tokens)
            }
        };

        space.hset(
            &key,
            &[
                ("tokens", rescaled.to_string()),
                ("max_tokens", max_tokens.to_string()),
                ("refill_rate", refill_rate.to_string()),
            ],
        );
        Ok(())
    }

    async fn delete_bucket(&self, id: i64) -> Result<()> {
        let mut space = self.space.lock().await;
        space.hashes.remove(&bucket_key(id));
        Ok(())
    }
}

#[async_trait]
impl CircuitStore for MemoryStore {
    async fn record_failure(
        &self,
        id: i64,
        failure_threshold: u32,
        now_millis: i64,
        _ttl_seconds: i64,
    ) -> Result<()> {
        let mut space = self.space.lock().await;
        let key = circuit_key(id);
        let mut state = space
            .hashes
            .get(&key)
            .map(|hash| {
                CircuitState::decode(
                    hash,
                    failure_threshold,
                    self.config.circuit_breaker.timeout_duration_seconds,
                )
            })
            .unwrap_or_else(|| {
                CircuitState::closed(
                    failure_threshold,
                    self.config.circuit_breaker.timeout_duration_seconds,
                )
            });

        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                state.opened_at_millis = Some(now_millis);
            }
            CircuitStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= state.failure_threshold {
                    state.status = CircuitStatus::Open;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at_millis = Some(now_millis);
                }
            }
            CircuitStatus::Open => {}
        }

        space.hset(&key, &state.encode());
        Ok(())
    }

    async fn record_success(
        &self,
        id: i64,
        success_threshold: u32,
        _ttl_seconds: i64,
    ) -> Result<()> {
        let mut space = self.space.lock().await;
        let key = circuit_key(id);
        let mut state = space
            .hashes
            .get(&key)
            .map(|hash| {
                CircuitState::decode(
                    hash,
                    self.config.circuit_breaker.failure_threshold,
                    self.config.circuit_breaker.timeout_duration_seconds,
                )
            })
            .unwrap_or_else(|| {
                CircuitState::closed(
                    self.config.circuit_breaker.failure_threshold,
                    self.config.circuit_breaker.timeout_duration_seconds,
                )
            });

        match state.status {
            CircuitStatus::Closed => state.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= success_threshold {
                    state.status = CircuitStatus::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at_millis = None;
                }
            }
            CircuitStatus::Open => {}
        }

        space.hset(&key, &state.encode());
        Ok(())
    }

    async fn read_circuit(&self, id: i64) -> Result<Option<CircuitState>> {
        let space = self.space.lock().await;
        Ok(space.hashes.get(&circuit_key(id)).map(|hash| {
            CircuitState::decode(
                hash,
                self.config.circuit_breaker.failure_threshold,
                self.config.circuit_breaker.timeout_duration_seconds,
            )
        }))
    }

    async fn write_circuit(&self, id: i64, state: &CircuitState, _ttl_seconds: i64) -> Result<()> {
        let mut space = self.space.lock().await;
        space.hset(&circuit_key(id), &state.encode());
        Ok(())
    }
}
