// tests/legacy_pool_tests.rs

// The superseded script generation, selected via `pool.script_generation`,
// runs behind the same store interface: selection debits the window counter
// in place over the ready set, returns are health bookkeeping only, and
// there is no cooldown state.

use std::sync::Arc;

use useragent_pool::{
    bootstrap_in_memory, AppConfig, Disposition, ManualClock, MemberStatus, PoolHandles,
    ReturnOutcome, ScriptGeneration, SessionCredentials,
};

const START: i64 = 1_700_000_000_000;
const HOUR: i64 = 3_600_000;

fn legacy_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pool.script_generation = ScriptGeneration::Legacy;
    config
}

fn handles_with(config: AppConfig) -> (PoolHandles, Arc<ManualClock>) {
    let clock = ManualClock::new(START);
    let handles = bootstrap_in_memory(&config, clock.clone());
    (handles, clock)
}

fn handles() -> (PoolHandles, Arc<ManualClock>) {
    handles_with(legacy_config())
}

async fn add_ready_member(handles: &PoolHandles, id: i64) {
    handles
        .pool
        .add_to_pool(id, format!("Mozilla/5.0 (agent {id})"))
        .await
        .unwrap();
    handles
        .pool
        .update_session(
            id,
            &SessionCredentials {
                session_token: "tok-test".to_string(),
                nid: None,
                mustit_uid: None,
                expires_at_millis: START + 24 * HOUR,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn selection_debits_the_window_without_leaving_rotation() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;

    // The member stays in the ready set, so back-to-back selections hand
    // out the same identity while its window budget lasts.
    let first = handles.pool.borrow().await.unwrap().unwrap();
    let second = handles.pool.borrow().await.unwrap().unwrap();
    assert_eq!(first.user_agent_id, 1);
    assert_eq!(second.user_agent_id, 1);
    assert_eq!(second.remaining_tokens, 78);
    assert_eq!(second.status, MemberStatus::Idle);
    assert_eq!(second.borrowed_at, None);
}

#[tokio::test]
async fn window_exhaustion_blocks_selection_until_the_window_rolls() {
    let mut config = legacy_config();
    config.pool.max_tokens = 2;
    let (handles, clock) = handles_with(config);
    add_ready_member(&handles, 1).await;

    assert!(handles.pool.borrow().await.unwrap().is_some());
    assert!(handles.pool.borrow().await.unwrap().is_some());
    assert!(handles.pool.borrow().await.unwrap().is_none());

    clock.advance_millis(600_001);
    let member = handles.pool.borrow().await.unwrap().unwrap();
    assert_eq!(member.remaining_tokens, 1);
}

#[tokio::test]
async fn selection_demotes_members_with_expired_sessions() {
    let (handles, clock) = handles();
    handles.pool.add_to_pool(1, "ua-1").await.unwrap();
    handles
        .pool
        .update_session(
            1,
            &SessionCredentials {
                session_token: "tok-test".to_string(),
                nid: None,
                mustit_uid: None,
                expires_at_millis: START + 1_000,
            },
        )
        .await
        .unwrap();

    clock.advance_millis(2_000);
    assert!(handles.pool.borrow().await.unwrap().is_none());
    let member = handles.pool.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(member.status, MemberStatus::SessionRequired);
    assert_eq!(member.session_token, None);
}

#[tokio::test]
async fn successful_return_maps_to_idle_and_restores_health() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;
    handles.pool.update_health_score(1, 90).await.unwrap();

    handles.pool.borrow().await.unwrap().unwrap();
    let disposition = handles
        .pool
        .give_back(1, ReturnOutcome::Success)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Idle);

    let member = handles.pool.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(member.health_score, 95);
    assert_eq!(member.consecutive_rate_limits, 0);
}

#[tokio::test]
async fn failure_above_the_floor_keeps_the_member_in_rotation() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;

    handles.pool.borrow().await.unwrap().unwrap();
    let disposition = handles
        .pool
        .give_back(1, ReturnOutcome::Failure { http_status: 502 })
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Idle);

    let member = handles.pool.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(member.health_score, 90);
    assert!(handles.pool.borrow().await.unwrap().is_some());
}

#[tokio::test]
async fn failure_below_the_floor_suspends_and_clears_the_session() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;
    handles.pool.update_health_score(1, 34).await.unwrap();

    handles.pool.borrow().await.unwrap().unwrap();
    let disposition = handles
        .pool
        .give_back(1, ReturnOutcome::Failure { http_status: 502 })
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Suspended);

    let member = handles.pool.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(member.status, MemberStatus::Suspended);
    assert_eq!(member.health_score, 24);
    assert_eq!(member.session_token, None);
    assert_eq!(handles.pool.suspended_ids().await.unwrap(), vec![1]);
    assert!(handles.pool.borrow().await.unwrap().is_none());
}

#[tokio::test]
async fn throttled_returns_take_the_light_penalty_without_cooldown() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;

    handles.pool.borrow().await.unwrap().unwrap();
    let disposition = handles
        .pool
        .give_back(1, ReturnOutcome::RateLimited)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Idle);

    // No cooldown state in this generation: the penalty is plain health.
    let member = handles.pool.find_by_id(1).await.unwrap().unwrap();
    assert_eq!(member.health_score, 95);
    assert_eq!(member.cooldown_until, None);
    assert_ne!(member.status, MemberStatus::Cooldown);
}

#[tokio::test]
async fn returns_never_report_not_borrowed() {
    let (handles, _clock) = handles();
    add_ready_member(&handles, 1).await;

    // No borrowed set exists to guard against, so an unmatched return is
    // plain health bookkeeping.
    let disposition = handles
        .pool
        .give_back(1, ReturnOutcome::Success)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Idle);
}

#[tokio::test]
async fn cooldown_recovery_is_a_noop() {
    let (handles, clock) = handles();
    add_ready_member(&handles, 1).await;

    clock.advance_millis(HOUR);
    assert_eq!(handles.pool.recover_cooldowns().await.unwrap(), 0);
}
