// src/scripts.rs

//! Lua sources for every multi-key pool transition, plus the loader that
//! registers them with Redis at store construction.
//!
//! Each script is one indivisible read-modify-write over the member hash and
//! the status-membership sets; no transition is ever split into separate
//! round trips. Two generations exist: the current borrow/return/recover
//! set, and the superseded single-purpose set kept selectable during the
//! migration window.

use deadpool_redis::Connection;
use redis::Script;

use crate::error::{PoolError, Result};

/// Selects an idle member with a live session and window budget, moves it
/// idle -> borrowed and stamps `borrowedAt`. Members found with a missing or
/// expired session are demoted to session_required on the way. Returns the
/// selected id, or nil when no member qualifies.
///
/// KEYS: idle set, member key prefix, borrowed set, session_required set.
/// ARGV: now_ms, max_tokens, window_duration_ms.
pub const BORROW: &str = r#"
local idle_key = KEYS[1]
local pool_prefix = KEYS[2]
local borrowed_key = KEYS[3]
local session_required_key = KEYS[4]

local now = tonumber(ARGV[1])
local max_tokens = tonumber(ARGV[2])
local window_duration = tonumber(ARGV[3])

local candidates = redis.call('SMEMBERS', idle_key)
table.sort(candidates)

for _, id in ipairs(candidates) do
  local member_key = pool_prefix .. id
  local vals = redis.call('HMGET', member_key,
    'sessionToken', 'sessionExpiresAt', 'remainingTokens', 'windowEnd')
  local token = vals[1]
  local expires_at = tonumber(vals[2]) or 0
  local remaining = tonumber(vals[3]) or max_tokens
  local window_end = tonumber(vals[4]) or 0

  if token == false or token == '' or expires_at <= now then
    redis.call('SREM', idle_key, id)
    redis.call('SADD', session_required_key, id)
    redis.call('HSET', member_key, 'status', 'SESSION_REQUIRED',
      'sessionToken', '', 'nid', '', 'mustitUid', '', 'sessionExpiresAt', '0')
  else
    if window_end <= now then
      remaining = max_tokens
      redis.call('HSET', member_key,
        'windowStart', tostring(now),
        'windowEnd', tostring(now + window_duration))
    end
    if remaining > 0 then
      redis.call('HSET', member_key,
        'remainingTokens', tostring(remaining - 1),
        'status', 'BORROWED',
        'borrowedAt', tostring(now))
      redis.call('SREM', idle_key, id)
      redis.call('SADD', borrowed_key, id)
      return id
    end
  end
end

return false
"#;

/// Moves a borrowed member to idle, cooldown or suspended depending on the
/// outcome. Returns -1 when the member is not borrowed (no-op), otherwise
/// the disposition code 0=idle, 1=cooldown, 2=suspended.
///
/// KEYS: borrowed set, idle set, cooldown set, suspended set, member key
/// prefix. ARGV: id, outcome (0=success, 1=rate_limited, 2=failure),
/// now_ms, health_delta, cooldown_base_ms, rate_limit_threshold,
/// health_floor.
pub const GIVE_BACK: &str = r#"
local borrowed_key = KEYS[1]
local idle_key = KEYS[2]
local cooldown_key = KEYS[3]
local suspended_key = KEYS[4]
local pool_prefix = KEYS[5]

local id = ARGV[1]
local outcome = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local health_delta = tonumber(ARGV[4])
local cooldown_base = tonumber(ARGV[5])
local threshold = tonumber(ARGV[6])
local health_floor = tonumber(ARGV[7])

if redis.call('SREM', borrowed_key, id) == 0 then
  return -1
end

local member_key = pool_prefix .. id
redis.call('HSET', member_key, 'borrowedAt', '0')

local health = tonumber(redis.call('HGET', member_key, 'healthScore')) or 100

if outcome == 0 then
  health = math.min(100, health + health_delta)
  redis.call('HSET', member_key,
    'healthScore', tostring(health),
    'consecutiveRateLimits', '0',
    'status', 'IDLE')
  redis.call('SADD', idle_key, id)
  return 0
end

if outcome == 1 then
  local streak = redis.call('HINCRBY', member_key, 'consecutiveRateLimits', 1)
  if streak >= threshold then
    redis.call('HSET', member_key,
      'status', 'COOLDOWN',
      'cooldownUntil', tostring(now + cooldown_base * streak))
    redis.call('SADD', cooldown_key, id)
    return 1
  end
  redis.call('HSET', member_key, 'status', 'IDLE')
  redis.call('SADD', idle_key, id)
  return 0
end

health = math.max(0, health - health_delta)
redis.call('HSET', member_key,
  'healthScore', tostring(health),
  'consecutiveRateLimits', '0')
if health < health_floor then
  redis.call('HSET', member_key,
    'status', 'SUSPENDED',
    'suspendedAt', tostring(now),
    'sessionToken', '', 'nid', '', 'mustitUid', '', 'sessionExpiresAt', '0')
  redis.call('SADD', suspended_key, id)
  return 2
end
redis.call('HSET', member_key, 'status', 'IDLE')
redis.call('SADD', idle_key, id)
return 0
"#;

/// Scans the cooldown set and moves every member whose `cooldownUntil` has
/// elapsed to idle (session still valid) or session_required (expired).
/// Returns the recovered count.
///
/// KEYS: cooldown set, idle set, session_required set, member key prefix.
/// ARGV: now_ms.
pub const COOLDOWN_RECOVER: &str = r#"
local cooldown_key = KEYS[1]
local idle_key = KEYS[2]
local session_required_key = KEYS[3]
local pool_prefix = KEYS[4]
local now = tonumber(ARGV[1])

local recovered = 0
for _, id in ipairs(redis.call('SMEMBERS', cooldown_key)) do
  local member_key = pool_prefix .. id
  local vals = redis.call('HMGET', member_key,
    'cooldownUntil', 'sessionToken', 'sessionExpiresAt')
  local cooldown_until = tonumber(vals[1]) or 0
  local token = vals[2]
  local expires_at = tonumber(vals[3]) or 0

  if cooldown_until ~= 0 and cooldown_until <= now then
    redis.call('SREM', cooldown_key, id)
    redis.call('HSET', member_key, 'cooldownUntil', '0')
    if token ~= false and token ~= '' and expires_at > now then
      redis.call('HSET', member_key, 'status', 'IDLE')
      redis.call('SADD', idle_key, id)
    else
      redis.call('HSET', member_key, 'status', 'SESSION_REQUIRED',
        'sessionToken', '', 'nid', '', 'mustitUid', '', 'sessionExpiresAt', '0')
      redis.call('SADD', session_required_key, id)
    end
    recovered = recovered + 1
  end
end
return recovered
"#;

/// Superseded selection script: picks from the ready set and debits the
/// window counter without moving the member out of rotation. Kept for the
/// migration window; the ready set resolves to the idle key.
///
/// KEYS: ready set, member key prefix, session_required set.
/// ARGV: now_ms, max_tokens, window_duration_ms.
pub const LEGACY_CONSUME_TOKEN: &str = r#"
local ready_key = KEYS[1]
local pool_prefix = KEYS[2]
local session_required_key = KEYS[3]

local now = tonumber(ARGV[1])
local max_tokens = tonumber(ARGV[2])
local window_duration = tonumber(ARGV[3])

local candidates = redis.call('SMEMBERS', ready_key)
table.sort(candidates)

for _, id in ipairs(candidates) do
  local member_key = pool_prefix .. id
  local vals = redis.call('HMGET', member_key,
    'sessionToken', 'sessionExpiresAt', 'remainingTokens', 'windowEnd')
  local token = vals[1]
  local expires_at = tonumber(vals[2]) or 0
  local remaining = tonumber(vals[3]) or max_tokens
  local window_end = tonumber(vals[4]) or 0

  if token == false or token == '' or expires_at <= now then
    redis.call('SREM', ready_key, id)
    redis.call('SADD', session_required_key, id)
    redis.call('HSET', member_key, 'status', 'SESSION_REQUIRED',
      'sessionToken', '', 'nid', '', 'mustitUid', '', 'sessionExpiresAt', '0')
  else
    if window_end <= now then
      remaining = max_tokens
      redis.call('HSET', member_key,
        'windowStart', tostring(now),
        'windowEnd', tostring(now + window_duration))
    end
    if remaining > 0 then
      redis.call('HSET', member_key, 'remainingTokens', tostring(remaining - 1))
      return id
    end
  end
end

return false
"#;

/// Superseded success script: health +bonus, capped at 100.
///
/// KEYS: member key. ARGV: health_bonus.
pub const LEGACY_RECORD_SUCCESS: &str = r#"
local member_key = KEYS[1]
local bonus = tonumber(ARGV[1])
local health = tonumber(redis.call('HGET', member_key, 'healthScore')) or 100
health = math.min(100, health + bonus)
redis.call('HSET', member_key,
  'healthScore', tostring(health),
  'consecutiveRateLimits', '0')
return health
"#;

/// Superseded failure script: health -penalty; below the floor the member is
/// pulled from the ready set and suspended with its session cleared.
/// Returns 1 when suspended, 0 otherwise.
///
/// KEYS: member key, ready set, suspended set.
/// ARGV: penalty, health_floor, id, now_ms.
pub const LEGACY_RECORD_FAILURE: &str = r#"
local member_key = KEYS[1]
local ready_key = KEYS[2]
local suspended_key = KEYS[3]

local penalty = tonumber(ARGV[1])
local health_floor = tonumber(ARGV[2])
local id = ARGV[3]
local now = ARGV[4]

local health = tonumber(redis.call('HGET', member_key, 'healthScore')) or 100
health = math.max(0, health - penalty)
redis.call('HSET', member_key, 'healthScore', tostring(health))

if health < health_floor then
  redis.call('HSET', member_key,
    'status', 'SUSPENDED',
    'suspendedAt', now,
    'sessionToken', '', 'nid', '', 'mustitUid', '', 'sessionExpiresAt', '0')
  redis.call('SREM', ready_key, id)
  redis.call('SADD', suspended_key, id)
  return 1
end
return 0
"#;

/// Current-generation pool scripts, registered with Redis before the store
/// serves any traffic.
pub struct PoolScripts {
    pub borrow: Script,
    pub give_back: Script,
    pub cooldown_recover: Script,
}

impl PoolScripts {
    pub fn new() -> Self {
        Self {
            borrow: Script::new(BORROW),
            give_back: Script::new(GIVE_BACK),
            cooldown_recover: Script::new(COOLDOWN_RECOVER),
        }
    }

    /// Registers every script via SCRIPT LOAD. Failure here is fatal: the
    /// store must not serve borrow/return traffic without its scripts.
    pub async fn load(&self, conn: &mut Connection) -> Result<()> {
        load_script(conn, "borrow", BORROW).await?;
        load_script(conn, "give_back", GIVE_BACK).await?;
        load_script(conn, "cooldown_recover", COOLDOWN_RECOVER).await?;
        Ok(())
    }
}

impl Default for PoolScripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Legacy-generation pool scripts.
pub struct LegacyPoolScripts {
    pub consume_token: Script,
    pub record_success: Script,
    pub record_failure: Script,
}

impl LegacyPoolScripts {
    pub fn new() -> Self {
        Self {
            consume_token: Script::new(LEGACY_CONSUME_TOKEN),
            record_success: Script::new(LEGACY_RECORD_SUCCESS),
            record_failure: Script::new(LEGACY_RECORD_FAILURE),
        }
    }

    pub async fn load(&self, conn: &mut Connection) -> Result<()> {
        load_script(conn, "consume_token", LEGACY_CONSUME_TOKEN).await?;
        load_script(conn, "record_success", LEGACY_RECORD_SUCCESS).await?;
        load_script(conn, "record_failure", LEGACY_RECORD_FAILURE).await?;
        Ok(())
    }
}

impl Default for LegacyPoolScripts {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) async fn load_script(
    conn: &mut Connection,
    name: &'static str,
    source: &str,
) -> Result<()> {
    redis::cmd("SCRIPT")
        .arg("LOAD")
        .arg(source)
        .query_async::<_, String>(conn)
        .await
        .map_err(|source| PoolError::ScriptLoad { name, source })?;
    Ok(())
}
