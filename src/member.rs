// src/member.rs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle status of a pool member.
///
/// A member is present in exactly one status-membership set at a time; the
/// atomic scripts keep the set and the hash's `status` field consistent as
/// one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    SessionRequired,
    Idle,
    Borrowed,
    Cooldown,
    Suspended,
}

impl MemberStatus {
    /// Wire literal stored in the hash's `status` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionRequired => "SESSION_REQUIRED",
            Self::Idle => "IDLE",
            Self::Borrowed => "BORROWED",
            Self::Cooldown => "COOLDOWN",
            Self::Suspended => "SUSPENDED",
        }
    }

    /// Strict parse of a current-generation literal.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SESSION_REQUIRED" => Some(Self::SessionRequired),
            "IDLE" => Some(Self::Idle),
            "BORROWED" => Some(Self::Borrowed),
            "COOLDOWN" => Some(Self::Cooldown),
            "SUSPENDED" => Some(Self::Suspended),
            _ => None,
        }
    }

    /// Explicit legacy-alias table applied after the strict parse fails.
    fn from_legacy_alias(raw: &str) -> Option<Self> {
        match raw {
            "READY" | "AVAILABLE" => Some(Self::Idle),
            _ => None,
        }
    }

    /// Two-step decode: strict parse, then the legacy-alias table, then a
    /// safe default. Malformed cache data is recovered with a warning, never
    /// an error; the cache is a performance layer over a re-derivable source
    /// of truth.
    pub fn decode_lenient(raw: Option<&str>) -> Self {
        match raw {
            None => Self::SessionRequired,
            Some(raw) => {
                if let Some(status) = Self::parse(raw) {
                    return status;
                }
                if let Some(status) = Self::from_legacy_alias(raw) {
                    warn!(status = raw, "Legacy status literal remapped to IDLE");
                    return status;
                }
                warn!(
                    status = raw,
                    "Unrecognized status literal; falling back to SESSION_REQUIRED"
                );
                Self::SessionRequired
            }
        }
    }
}

/// Credentials a member holds after the session-acquisition collaborator
/// issues them. The cookie pair (`nid`, `mustit_uid`) is used by one crawl
/// mode only and may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub session_token: String,
    pub nid: Option<String>,
    pub mustit_uid: Option<String>,
    pub expires_at_millis: i64,
}

/// Cached pool member: the unit the pool manages.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMember {
    pub user_agent_id: i64,
    pub user_agent_value: String,
    pub session_token: Option<String>,
    pub nid: Option<String>,
    pub mustit_uid: Option<String>,
    pub session_expires_at: Option<i64>,
    pub remaining_tokens: u32,
    pub max_tokens: u32,
    pub window_start: Option<i64>,
    pub window_end: Option<i64>,
    pub health_score: u8,
    pub status: MemberStatus,
    pub suspended_at: Option<i64>,
    pub borrowed_at: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub consecutive_rate_limits: u32,
}

impl PoolMember {
    /// Fresh member as it enters the pool: no session yet, full window.
    pub fn new(user_agent_id: i64, user_agent_value: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            user_agent_id,
            user_agent_value: user_agent_value.into(),
            session_token: None,
            nid: None,
            mustit_uid: None,
            session_expires_at: None,
            remaining_tokens: max_tokens,
            max_tokens,
            window_start: None,
            window_end: None,
            health_score: 100,
            status: MemberStatus::SessionRequired,
            suspended_at: None,
            borrowed_at: None,
            cooldown_until: None,
            consecutive_rate_limits: 0,
        }
    }

    /// Whether the member holds a session that is still valid at `now`.
    pub fn has_valid_session(&self, now_millis: i64) -> bool {
        self.session_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.session_expires_at.is_some_and(|at| at > now_millis)
    }
}

/// Outcome a crawl worker reports when returning a borrowed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    Success,
    /// The marketplace throttled the request (HTTP 429).
    RateLimited,
    /// Hard failure; carries the HTTP status for the penalty policy.
    Failure {
        http_status: u16,
    },
}

/// Where a return transition landed the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Idle,
    Cooldown,
    Suspended,
    /// The member was not in the borrowed set; the return was a no-op.
    /// Expected under races, not an error.
    NotBorrowed,
}

/// Derived, non-persistent aggregate over the status sets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub borrowed: usize,
    pub cooldown: usize,
    pub session_required: usize,
    pub suspended: usize,
    pub health_min: u8,
    pub health_avg: f64,
    pub health_max: u8,
}

pub mod codec {
    //! Bidirectional mapping between the Redis hash representation and
    //! [`PoolMember`]. Decoding never fails: each field falls back to an
    //! explicit default and `"0"`/empty strings decode to absent.

    use super::*;

    /// Hash field names, also referenced by the Lua scripts.
    pub const FIELDS: [&str; 16] = [
        "userAgentId",
        "userAgentValue",
        "sessionToken",
        "nid",
        "mustitUid",
        "sessionExpiresAt",
        "remainingTokens",
        "maxTokens",
        "windowStart",
        "windowEnd",
        "healthScore",
        "status",
        "suspendedAt",
        "borrowedAt",
        "cooldownUntil",
        "consecutiveRateLimits",
    ];

    fn opt_string(data: &HashMap<String, String>, field: &str) -> Option<String> {
        data.get(field).filter(|v| !v.is_empty()).cloned()
    }

    fn opt_millis(data: &HashMap<String, String>, field: &str) -> Option<i64> {
        let raw = data.get(field)?;
        if raw.is_empty() || raw == "0" {
            return None;
        }
        match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(field, value = %raw, "Unparseable timestamp in member hash; treating as absent");
                None
            }
        }
    }

    fn parse_or<T: std::str::FromStr>(data: &HashMap<String, String>, field: &str, default: T) -> T {
        match data.get(field) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(field, value = %raw, "Unparseable numeric field in member hash; using default");
                default
            }),
            None => default,
        }
    }

    /// Decodes a member hash. `default_max_tokens` is the configured window
    /// ceiling, used when `maxTokens`/`remainingTokens` are missing.
    pub fn decode(data: &HashMap<String, String>, default_max_tokens: u32) -> PoolMember {
        let max_tokens = parse_or(data, "maxTokens", default_max_tokens);
        PoolMember {
            user_agent_id: parse_or(data, "userAgentId", 0),
            user_agent_value: data.get("userAgentValue").cloned().unwrap_or_default(),
            session_token: opt_string(data, "sessionToken"),
            nid: opt_string(data, "nid"),
            mustit_uid: opt_string(data, "mustitUid"),
            session_expires_at: opt_millis(data, "sessionExpiresAt"),
            remaining_tokens: parse_or(data, "remainingTokens", max_tokens),
            max_tokens,
            window_start: opt_millis(data, "windowStart"),
            window_end: opt_millis(data, "windowEnd"),
            health_score: parse_or(data, "healthScore", 100).min(100),
            status: MemberStatus::decode_lenient(data.get("status").map(String::as_str)),
            suspended_at: opt_millis(data, "suspendedAt"),
            borrowed_at: opt_millis(data, "borrowedAt"),
            cooldown_until: opt_millis(data, "cooldownUntil"),
            consecutive_rate_limits: parse_or(data, "consecutiveRateLimits", 0),
        }
    }

    /// Encodes the full field set; absent values encode as `""`/`"0"` so the
    /// hash always carries every field.
    pub fn encode(member: &PoolMember) -> Vec<(&'static str, String)> {
        fn millis(value: Option<i64>) -> String {
            value.map_or_else(|| "0".to_string(), |v| v.to_string())
        }
        vec![
            ("userAgentId", member.user_agent_id.to_string()),
            ("userAgentValue", member.user_agent_value.clone()),
            (
                "sessionToken",
                member.session_token.clone().unwrap_or_default(),
            ),
            ("nid", member.nid.clone().unwrap_or_default()),
            ("mustitUid", member.mustit_uid.clone().unwrap_or_default()),
            ("sessionExpiresAt", millis(member.session_expires_at)),
            ("remainingTokens", member.remaining_tokens.to_string()),
            ("maxTokens", member.max_tokens.to_string()),
            ("windowStart", millis(member.window_start)),
            ("windowEnd", millis(member.window_end)),
            ("healthScore", member.health_score.to_string()),
            ("status", member.status.as_str().to_string()),
            ("suspendedAt", millis(member.suspended_at)),
            ("borrowedAt", millis(member.borrowed_at)),
            ("cooldownUntil", millis(member.cooldown_until)),
            (
                "consecutiveRateLimits",
                member.consecutive_rate_limits.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::codec;
    use super::*;
    use rstest::rstest;

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn sample_member() -> PoolMember {
        PoolMember {
            user_agent_id: 7,
            user_agent_value: "Mozilla/5.0 (crawler)".to_string(),
            session_token: Some("tok-abc".to_string()),
            nid: Some("nid-1".to_string()),
            mustit_uid: None,
            session_expires_at: Some(1_700_000_000_000),
            remaining_tokens: 42,
            max_tokens: 80,
            window_start: Some(1_699_999_400_000),
            window_end: Some(1_700_000_000_000),
            health_score: 85,
            status: MemberStatus::Idle,
            suspended_at: None,
            borrowed_at: None,
            cooldown_until: None,
            consecutive_rate_limits: 2,
        }
    }

    #[test]
    fn round_trip_is_lossless() {
        let member = sample_member();
        let decoded = codec::decode(&as_map(codec::encode(&member)), 80);
        assert_eq!(decoded, member);
    }

    #[test]
    fn round_trip_preserves_every_status() {
        for status in [
            MemberStatus::SessionRequired,
            MemberStatus::Idle,
            MemberStatus::Borrowed,
            MemberStatus::Cooldown,
            MemberStatus::Suspended,
        ] {
            let mut member = sample_member();
            member.status = status;
            let decoded = codec::decode(&as_map(codec::encode(&member)), 80);
            assert_eq!(decoded.status, status);
        }
    }

    #[rstest]
    #[case("READY", MemberStatus::Idle)]
    #[case("AVAILABLE", MemberStatus::Idle)]
    #[case("IDLE", MemberStatus::Idle)]
    #[case("BORROWED", MemberStatus::Borrowed)]
    #[case("COOLDOWN", MemberStatus::Cooldown)]
    #[case("SUSPENDED", MemberStatus::Suspended)]
    #[case("SESSION_REQUIRED", MemberStatus::SessionRequired)]
    fn status_literals_decode(#[case] raw: &str, #[case] expected: MemberStatus) {
        let mut data = as_map(codec::encode(&sample_member()));
        data.insert("status".to_string(), raw.to_string());
        assert_eq!(codec::decode(&data, 80).status, expected);
    }

    #[test]
    fn unknown_status_falls_back_to_session_required() {
        let mut data = as_map(codec::encode(&sample_member()));
        data.insert("status".to_string(), "UNKNOWN_STATUS_XYZ".to_string());
        assert_eq!(
            codec::decode(&data, 80).status,
            MemberStatus::SessionRequired
        );
    }

    #[test]
    fn missing_status_defaults_to_session_required() {
        let mut data = as_map(codec::encode(&sample_member()));
        data.remove("status");
        assert_eq!(
            codec::decode(&data, 80).status,
            MemberStatus::SessionRequired
        );
    }

    #[test]
    fn missing_counters_use_configured_defaults() {
        let data = HashMap::from([
            ("userAgentId".to_string(), "3".to_string()),
            ("userAgentValue".to_string(), "ua".to_string()),
        ]);
        let member = codec::decode(&data, 80);
        assert_eq!(member.remaining_tokens, 80);
        assert_eq!(member.max_tokens, 80);
        assert_eq!(member.health_score, 100);
        assert_eq!(member.consecutive_rate_limits, 0);
    }

    #[rstest]
    #[case("0")]
    #[case("")]
    fn zero_or_empty_timestamps_decode_to_absent(#[case] raw: &str) {
        let mut data = as_map(codec::encode(&sample_member()));
        for field in ["sessionExpiresAt", "suspendedAt", "borrowedAt", "cooldownUntil"] {
            data.insert(field.to_string(), raw.to_string());
        }
        let member = codec::decode(&data, 80);
        assert_eq!(member.session_expires_at, None);
        assert_eq!(member.suspended_at, None);
        assert_eq!(member.borrowed_at, None);
        assert_eq!(member.cooldown_until, None);
    }

    #[test]
    fn empty_session_fields_decode_to_none() {
        let mut member = sample_member();
        member.session_token = None;
        member.nid = None;
        member.mustit_uid = None;
        let decoded = codec::decode(&as_map(codec::encode(&member)), 80);
        assert_eq!(decoded.session_token, None);
        assert_eq!(decoded.nid, None);
        assert_eq!(decoded.mustit_uid, None);
    }

    #[test]
    fn malformed_numeric_field_does_not_panic() {
        let mut data = as_map(codec::encode(&sample_member()));
        data.insert("healthScore".to_string(), "not-a-number".to_string());
        data.insert("remainingTokens".to_string(), "???".to_string());
        let member = codec::decode(&data, 80);
        assert_eq!(member.health_score, 100);
        assert_eq!(member.remaining_tokens, 80);
    }

    #[test]
    fn session_validity_checks_token_and_expiry() {
        let mut member = sample_member();
        assert!(member.has_valid_session(member.session_expires_at.unwrap() - 1));
        assert!(!member.has_valid_session(member.session_expires_at.unwrap()));
        member.session_token = None;
        assert!(!member.has_valid_session(0));
    }
}
