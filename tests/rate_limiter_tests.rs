// tests/rate_limiter_tests.rs

use std::sync::Arc;

use useragent_pool::{bootstrap_in_memory, AppConfig, ManualClock, PoolHandles};

const START: i64 = 1_700_000_000_000;

fn handles() -> (PoolHandles, Arc<ManualClock>) {
    let clock = ManualClock::new(START);
    let handles = bootstrap_in_memory(&AppConfig::default(), clock.clone());
    (handles, clock)
}

#[tokio::test]
async fn fresh_bucket_grants_the_full_window_budget() {
    let (handles, _clock) = handles();

    // 80 requests in a 10-minute window with a frozen clock: nothing refills.
    for i in 0..80 {
        let decision = handles.rate_limiter.try_consume(7).await.unwrap();
        assert!(decision.allowed, "request {} was denied", i + 1);
    }

    let decision = handles.rate_limiter.try_consume(7).await.unwrap();
    assert!(!decision.allowed);
    // One token at 80/600 tokens per second takes 7.5 seconds to accrue.
    assert_eq!(decision.retry_after_millis, 7_500);
}

#[tokio::test]
async fn tokens_are_conserved_under_a_frozen_clock() {
    let (handles, _clock) = handles();

    for _ in 0..10 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    let status = handles.rate_limiter.bucket_status(7).await.unwrap().unwrap();
    assert!((status.tokens - 70.0).abs() < 1e-9);
}

#[tokio::test]
async fn elapsed_time_refills_up_to_the_ceiling() {
    let (handles, clock) = handles();

    for _ in 0..80 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    assert!(!handles.rate_limiter.allow(7).await.unwrap());

    // 7.5s accrues exactly one token.
    clock.advance_millis(7_500);
    assert!(handles.rate_limiter.allow(7).await.unwrap());
    assert!(!handles.rate_limiter.allow(7).await.unwrap());

    // A long idle period refills to the ceiling, never past it.
    clock.advance_millis(24 * 3_600_000);
    let status = handles.rate_limiter.bucket_status(7).await.unwrap().unwrap();
    assert!(status.tokens <= 80.0);
    let decision = handles.rate_limiter.try_consume(7).await.unwrap();
    assert!(decision.allowed);
    assert!((decision.current_tokens - 79.0).abs() < 1e-6);
}

#[tokio::test]
async fn buckets_are_independent_per_identity() {
    let (handles, _clock) = handles();

    for _ in 0..80 {
        handles.rate_limiter.try_consume(1).await.unwrap();
    }
    assert!(!handles.rate_limiter.allow(1).await.unwrap());
    assert!(handles.rate_limiter.allow(2).await.unwrap());
}

#[tokio::test]
async fn wait_time_is_zero_for_a_missing_bucket() {
    let (handles, _clock) = handles();
    assert_eq!(handles.rate_limiter.wait_time(99).await.unwrap(), 0);
}

#[tokio::test]
async fn wait_time_shrinks_as_the_clock_advances() {
    let (handles, clock) = handles();

    for _ in 0..80 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    let initial = handles.rate_limiter.wait_time(7).await.unwrap();
    assert_eq!(initial, 7_500);

    clock.advance_millis(3_000);
    let later = handles.rate_limiter.wait_time(7).await.unwrap();
    assert!(later < initial);
    assert!(later > 0);

    clock.advance_millis(5_000);
    assert_eq!(handles.rate_limiter.wait_time(7).await.unwrap(), 0);
}

#[tokio::test]
async fn wait_time_is_capped_at_the_configured_maximum() {
    let mut config = AppConfig::default();
    config.rate_limiter.max_wait_millis = 5_000;
    let clock = ManualClock::new(START);
    let handles = bootstrap_in_memory(&config, clock);

    for _ in 0..80 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    // 40 tokens would take 300s to accrue; the projection is clamped.
    assert_eq!(handles.rate_limiter.wait_time_for(7, 40).await.unwrap(), 5_000);
}

#[tokio::test]
async fn shrinking_the_ceiling_rescales_the_balance_proportionally() {
    let (handles, _clock) = handles();

    for _ in 0..40 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    // 40 of 80 left; at a ceiling of 40 that is 20.
    handles.rate_limiter.update_bucket(7, 40, 0.1).await.unwrap();

    let status = handles.rate_limiter.bucket_status(7).await.unwrap().unwrap();
    assert_eq!(status.max_tokens, 40);
    assert!((status.tokens - 20.0).abs() < 1e-9);
    assert!((status.refill_rate - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn growing_the_ceiling_never_grants_tokens_beyond_it() {
    let (handles, _clock) = handles();

    for _ in 0..80 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    handles.rate_limiter.update_bucket(7, 160, 0.2).await.unwrap();

    let status = handles.rate_limiter.bucket_status(7).await.unwrap().unwrap();
    assert!(status.tokens <= 160.0);
    // Empty stays empty: 0 * 160/80 = 0.
    assert!(status.tokens.abs() < 1e-9);
}

#[tokio::test]
async fn updating_a_missing_bucket_initializes_it_full() {
    let (handles, _clock) = handles();
    handles.rate_limiter.update_bucket(7, 50, 0.5).await.unwrap();

    let status = handles.rate_limiter.bucket_status(7).await.unwrap().unwrap();
    assert_eq!(status.max_tokens, 50);
    assert!((status.tokens - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn deleting_a_bucket_resets_the_identity_to_a_full_budget() {
    let (handles, _clock) = handles();

    for _ in 0..80 {
        handles.rate_limiter.try_consume(7).await.unwrap();
    }
    assert!(!handles.rate_limiter.allow(7).await.unwrap());

    handles.rate_limiter.delete_bucket(7).await.unwrap();
    let decision = handles.rate_limiter.try_consume(7).await.unwrap();
    assert!(decision.allowed);
    assert!((decision.current_tokens - 79.0).abs() < 1e-9);
}

#[tokio::test]
async fn multi_token_requests_debit_and_deny_correctly() {
    let (handles, _clock) = handles();

    let decision = handles
        .rate_limiter
        .try_consume_tokens(7, 30)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert!((decision.current_tokens - 50.0).abs() < 1e-9);

    let decision = handles
        .rate_limiter
        .try_consume_tokens(7, 60)
        .await
        .unwrap();
    assert!(!decision.allowed);
    // Ten tokens short at 80/600 per second: 75 seconds.
    assert_eq!(decision.retry_after_millis, 75_000);
}
