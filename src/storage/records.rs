// src/storage/records.rs

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

/// Result of one token-bucket consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_tokens: f64,
    pub retry_after_millis: i64,
}

/// Snapshot of a bucket record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStatus {
    pub tokens: f64,
    pub last_refill_millis: i64,
    pub max_tokens: u32,
    pub refill_rate: f64,
}

/// Circuit breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Per-identity circuit breaker record. Independent of both the pool record
/// and the rate-limit bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at_millis: Option<i64>,
    pub failure_threshold: u32,
    pub timeout_duration_seconds: i64,
}

impl CircuitState {
    /// Fresh CLOSED record with the given thresholds; the breaker is
    /// self-bootstrapping and never requires explicit provisioning.
    pub fn closed(failure_threshold: u32, timeout_duration_seconds: i64) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at_millis: None,
            failure_threshold,
            timeout_duration_seconds,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == CircuitStatus::Open
    }

    /// Whether the open window has elapsed at `now`.
    pub fn open_timeout_elapsed(&self, now_millis: i64) -> bool {
        match self.opened_at_millis {
            Some(opened_at) => {
                (now_millis - opened_at) / 1000 >= self.timeout_duration_seconds
            }
            None => false,
        }
    }

    /// Decodes a circuit hash leniently; like the pool codec, corrupt fields
    /// fall back to defaults rather than erroring.
    pub fn decode(
        data: &HashMap<String, String>,
        default_failure_threshold: u32,
        default_timeout_seconds: i64,
    ) -> Self {
        let status = match data.get("state") {
            Some(raw) => CircuitStatus::parse(raw).unwrap_or_else(|| {
                warn!(state = %raw, "Unrecognized circuit state literal; treating as CLOSED");
                CircuitStatus::Closed
            }),
            None => CircuitStatus::Closed,
        };
        let parse_u32 = |field: &str, default: u32| {
            data.get(field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let opened_at_millis = data
            .get("opened_at")
            .filter(|v| !v.is_empty() && v.as_str() != "0")
            .and_then(|v| v.parse().ok());
        Self {
            status,
            consecutive_failures: parse_u32("consecutive_failures", 0),
            consecutive_successes: parse_u32("consecutive_successes", 0),
            opened_at_millis,
            failure_threshold: parse_u32("failure_threshold", default_failure_threshold),
            timeout_duration_seconds: data
                .get("timeout_duration_seconds")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_timeout_seconds),
        }
    }

    /// Encodes the full circuit hash; absent `opened_at` encodes as `"0"`.
    pub fn encode(&self) -> Vec<(&'static str, String)> {
        vec![
            ("state", self.status.as_str().to_string()),
            (
                "consecutive_failures",
                self.consecutive_failures.to_string(),
            ),
            (
                "consecutive_successes",
                self.consecutive_successes.to_string(),
            ),
            (
                "opened_at",
                self.opened_at_millis
                    .map_or_else(|| "0".to_string(), |v| v.to_string()),
            ),
            ("failure_threshold", self.failure_threshold.to_string()),
            (
                "timeout_duration_seconds",
                self.timeout_duration_seconds.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_round_trip() {
        let state = CircuitState {
            status: CircuitStatus::Open,
            consecutive_failures: 2,
            consecutive_successes: 0,
            opened_at_millis: Some(1_700_000_000_000),
            failure_threshold: 3,
            timeout_duration_seconds: 600,
        };
        let map: HashMap<String, String> = state
            .encode()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(CircuitState::decode(&map, 3, 600), state);
    }

    #[test]
    fn zero_opened_at_decodes_to_absent() {
        let mut state = CircuitState::closed(3, 600);
        state.opened_at_millis = None;
        let map: HashMap<String, String> = state
            .encode()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(CircuitState::decode(&map, 3, 600).opened_at_millis, None);
    }

    #[test]
    fn unknown_state_literal_falls_back_to_closed() {
        let map = HashMap::from([("state".to_string(), "BROKEN".to_string())]);
        assert_eq!(
            CircuitState::decode(&map, 3, 600).status,
            CircuitStatus::Closed
        );
    }

    #[test]
    fn timeout_elapse_is_second_granular() {
        let mut state = CircuitState::closed(3, 600);
        state.status = CircuitStatus::Open;
        state.opened_at_millis = Some(1_000_000);
        assert!(!state.open_timeout_elapsed(1_000_000 + 599_999));
        assert!(state.open_timeout_elapsed(1_000_000 + 600_000));
    }
}
