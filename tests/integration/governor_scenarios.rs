use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pagegist::config::{BudgetConfig, GateConfig, RetryConfig, TEXT_GENERATION_RESOURCE};
use pagegist::governor::{FileCache, Payload, RequestGovernor, TransportError};
use pagegist::GovernorError;
use tempfile::TempDir;

use crate::common::{memory_governor, summary_of, test_config, throttled, ScriptedTransport};

#[tokio::test]
async fn test_second_execute_served_from_durable_cache() {
    let temp_dir = TempDir::new().expect("temp dir");
    let transport = ScriptedTransport::new();
    let cache = Arc::new(FileCache::open(temp_dir.path()).await.expect("open"));
    let governor = RequestGovernor::new(test_config(), cache, transport.clone());
    let payload = Payload::new("the page").with_instruction("Summarise.");

    let first = governor.execute(payload.clone()).await.expect("first");
    let second = governor.execute(payload.clone()).await.expect("second");

    assert_eq!(
        serde_json::to_vec(&first).expect("json"),
        serde_json::to_vec(&second).expect("json")
    );
    assert_eq!(transport.call_count(), 1);

    // Survives a restart.
    let reopened = Arc::new(FileCache::open(temp_dir.path()).await.expect("reopen"));
    let restarted = RequestGovernor::new(test_config(), reopened, transport.clone());
    assert_eq!(restarted.execute(payload).await.expect("third"), first);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_concurrent_identical_payloads_share_one_call() {
    let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
    let (governor, cache) = memory_governor(test_config(), transport.clone());

    let results = join_all((0..10).map(|_| governor.execute(Payload::new("same page")))).await;

    assert_eq!(transport.call_count(), 1);
    for result in &results {
        assert_eq!(result.as_ref().expect("ok"), &summary_of("same page"));
    }
    assert_eq!(cache.len(), 1);
    let usage = governor.usage();
    assert_eq!(usage.metrics.coalesced_joins, 9);
    assert_eq!(usage.in_flight, 0);
}

#[tokio::test]
async fn test_a_a_b_with_single_slot() {
    let transport = ScriptedTransport::with_delay(Duration::from_millis(20));
    let config =
        test_config().with_gates(GateConfig::default().with_limit(TEXT_GENERATION_RESOURCE, 1));
    let (governor, _cache) = memory_governor(config, transport.clone());

    let (a1, a2, b) = tokio::join!(
        governor.execute(Payload::new("A")),
        governor.execute(Payload::new("A")),
        governor.execute(Payload::new("B")),
    );

    let a1 = a1.expect("a1");
    assert_eq!(a1, a2.expect("a2"));
    assert_eq!(b.expect("b"), summary_of("B"));
    assert_eq!(transport.calls_for("A"), 1);
    assert_eq!(transport.calls_for("B"), 1);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_oversized_payload_fails_immediately() {
    let transport = ScriptedTransport::new();
    let config = test_config().with_budget(BudgetConfig::default().with_token_limit(50));
    let (governor, cache) = memory_governor(config, transport.clone());

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        governor.execute(Payload::new("lorem ipsum ".repeat(200))),
    )
    .await
    .expect("must not wait in the queue");

    let err = outcome.unwrap_err();
    assert!(matches!(err, GovernorError::CostExceedsLimit { limit: 50, .. }));
    assert!(err.is_fatal());
    assert_eq!(transport.call_count(), 0);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_throttle_lowers_limit_and_waits_for_reset() {
    let transport = ScriptedTransport::new();
    transport.push(Err(throttled(500, Duration::from_secs(2))));
    let (governor, _cache) = memory_governor(test_config(), transport.clone());

    let completion = governor.execute(Payload::new("busy")).await.expect("ok");

    assert_eq!(completion, summary_of("busy"));
    assert_eq!(governor.scheduler().rate_limit().token_limit, 500);
    let times = transport.call_times();
    assert_eq!(times.len(), 2);
    assert!(times[1].duration_since(times[0]) >= Duration::from_secs(2));

    let usage = governor.usage();
    assert_eq!(usage.metrics.throttled, 1);
    assert_eq!(usage.scheduler.revisions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_that_never_stops_throttling_gives_up() {
    let transport = ScriptedTransport::new();
    for _ in 0..100 {
        transport.push(Err(throttled(10_000, Duration::from_secs(1))));
    }
    let config = test_config().with_retry(RetryConfig::default().with_max_throttled_attempts(3));
    let (governor, cache) = memory_governor(config, transport.clone());

    let err = tokio::time::timeout(
        Duration::from_secs(24 * 3600),
        governor.execute(Payload::new("always busy")),
    )
    .await
    .expect("terminal failure instead of an endless loop")
    .unwrap_err();

    assert!(matches!(err, GovernorError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert_eq!(transport.call_count(), 3);
    assert!(cache.is_empty());
    assert_eq!(governor.usage().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_huge_reset_value_is_capped_not_a_panic() {
    let transport = ScriptedTransport::new();
    transport.push(Err(throttled(10_000, Duration::MAX)));
    let (governor, _cache) = memory_governor(test_config(), transport.clone());

    let completion = governor.execute(Payload::new("slow reset")).await.expect("ok");

    assert_eq!(completion, summary_of("slow reset"));
    let times = transport.call_times();
    assert_eq!(times.len(), 2);
    assert!(times[1].duration_since(times[0]) <= Duration::from_secs(61));
}

#[tokio::test(start_paused = true)]
async fn test_throttle_without_metadata_is_fatal() {
    let transport = ScriptedTransport::new();
    transport.push(Err(TransportError::Throttled(Default::default())));
    let (governor, cache) = memory_governor(test_config(), transport.clone());

    let err = governor.execute(Payload::new("x")).await.unwrap_err();

    assert_eq!(err, GovernorError::MissingRateLimitField("tokenLimit"));
    assert_eq!(transport.call_count(), 1);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_then_recover() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        transport.push(Err(TransportError::Transient("502 Bad Gateway".to_string())));
    }
    let (governor, cache) = memory_governor(test_config(), transport.clone());
    let payload = Payload::new("flaky");

    let err = governor.execute(payload.clone()).await.unwrap_err();
    assert_eq!(
        err,
        GovernorError::RetriesExhausted {
            attempts: 3,
            last_error: "502 Bad Gateway".to_string()
        }
    );
    assert!(cache.is_empty());
    assert_eq!(governor.usage().in_flight, 0);

    // The failure is not cached; the next call goes back to the transport.
    let completion = governor.execute(payload).await.expect("recovered");
    assert_eq!(completion, summary_of("flaky"));
    assert_eq!(transport.call_count(), 4);
}

#[tokio::test]
async fn test_failure_reaches_every_joined_caller() {
    let transport = ScriptedTransport::with_delay(Duration::from_millis(30));
    transport.push(Err(TransportError::Fatal("no message in response".to_string())));
    let (governor, cache) = memory_governor(test_config(), transport.clone());

    let results = join_all((0..4).map(|_| governor.execute(Payload::new("bad")))).await;

    assert_eq!(transport.call_count(), 1);
    for result in results {
        assert_eq!(
            result,
            Err(GovernorError::Fatal("no message in response".to_string()))
        );
    }
    assert!(cache.is_empty());

    let retried = governor.execute(Payload::new("bad")).await.expect("retry");
    assert_eq!(retried, summary_of("bad"));
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_abandoned_caller_still_populates_cache() {
    let transport = ScriptedTransport::with_delay(Duration::from_millis(40));
    let (governor, cache) = memory_governor(test_config(), transport.clone());

    let abandoned = {
        let governor = governor.clone();
        tokio::spawn(async move { governor.execute(Payload::new("left behind")).await })
    };
    while transport.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    abandoned.abort();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(cache.len(), 1);
    let hit = governor.execute(Payload::new("left behind")).await.expect("hit");
    assert_eq!(hit, summary_of("left behind"));
    assert_eq!(transport.call_count(), 1);
}
