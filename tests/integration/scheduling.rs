use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pagegist::config::BudgetConfig;
use pagegist::governor::TokenBudgetScheduler;
use tokio::time::{sleep, timeout, Instant};

fn budget() -> BudgetConfig {
    BudgetConfig::default()
        .with_token_limit(100)
        .with_window(Duration::from_secs(1))
        .with_retention(Duration::from_secs(1))
        .with_recheck_interval(Duration::from_millis(100))
        .with_reserve_after(Duration::from_secs(2))
}

/// Keep submitting small requests faster than the budget refills.
fn spawn_small_stream(scheduler: TokenBudgetScheduler, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        while !stop.load(Ordering::SeqCst) {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = scheduler.admit(30, None).await;
            });
            sleep(Duration::from_millis(250)).await;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_large_request_is_not_starved() {
    let scheduler = TokenBudgetScheduler::new(budget());
    for _ in 0..3 {
        scheduler.admit(30, None).await.expect("small");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let large = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.admit(90, None).await.expect("large");
            Instant::now()
        })
    };
    while scheduler.usage().queued == 0 {
        tokio::task::yield_now().await;
    }
    spawn_small_stream(scheduler.clone(), stop.clone());

    let started = Instant::now();
    let admitted_at = timeout(Duration::from_secs(6), large)
        .await
        .expect("large request admitted while small ones keep arriving")
        .expect("join");
    stop.store(true, Ordering::SeqCst);

    assert!(admitted_at.duration_since(started) < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_usage_never_exceeds_limit_under_load() {
    let scheduler = TokenBudgetScheduler::new(budget());
    let admitted_tokens = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for i in 0..40u64 {
        let scheduler = scheduler.clone();
        let admitted_tokens = admitted_tokens.clone();
        handles.push(tokio::spawn(async move {
            let cost = 10 + (i % 5) * 10;
            scheduler.admit(cost, None).await.expect("admit");
            admitted_tokens.fetch_add(cost, Ordering::SeqCst);
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline && handles.iter().any(|h| !h.is_finished()) {
        let usage = scheduler.usage();
        assert!(
            usage.tokens_in_window <= usage.token_limit,
            "window holds {} tokens over a limit of {}",
            usage.tokens_in_window,
            usage.token_limit
        );
        sleep(Duration::from_millis(50)).await;
    }
    for handle in handles {
        handle.await.expect("join");
    }

    // 40 requests averaging 30 tokens against 100 per second.
    assert_eq!(admitted_tokens.load(Ordering::SeqCst), 1_200);
    assert_eq!(scheduler.usage().admitted, 40);
}

#[tokio::test(start_paused = true)]
async fn test_revision_mid_queue_applies_to_waiting_requests() {
    let scheduler = TokenBudgetScheduler::new(budget());
    scheduler.admit(100, None).await.expect("fill window");

    let waiting = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.admit(80, None).await })
    };
    let fitting = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.admit(40, None).await })
    };
    while scheduler.usage().queued < 2 {
        tokio::task::yield_now().await;
    }

    scheduler.revise_limit(50);

    let err = waiting.await.expect("join").unwrap_err();
    assert!(matches!(
        err,
        pagegist::GovernorError::CostExceedsLimit { cost: 80, limit: 50 }
    ));
    fitting.await.expect("join").expect("admitted once the window rolls");
    assert_eq!(scheduler.rate_limit().token_limit, 50);
}
