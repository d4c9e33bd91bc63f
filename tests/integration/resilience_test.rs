//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 熔断与自动恢复集成测试

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use mockall::mock;
use oxcache_backplane::config::ResilienceConfig;
use oxcache_backplane::error::{CacheError, Result};
use oxcache_backplane::protocol::Action;
use oxcache_backplane::recovery::{
    CallOutcome, CircuitState, RecoveryItem, RecoveryTarget, ResilienceController, Subsystem,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Target {}

    #[async_trait]
    impl RecoveryTarget for Target {
        async fn probe(&self) -> Result<()>;
        async fn replay(&self, item: &RecoveryItem) -> Result<()>;
    }
}

fn config() -> ResilienceConfig {
    ResilienceConfig {
        failure_threshold: 5,
        probe_interval_ms: 60_000,
        ..Default::default()
    }
}

async fn fail(
    controller: &ResilienceController,
    subsystem: Subsystem,
    item: Option<RecoveryItem>,
) -> CallOutcome<()> {
    controller
        .execute(subsystem, item, || async {
            Err(CacheError::Backplane("connection refused".to_string()))
        })
        .await
}

/// 连续 5 次失败后熔断，之后的调用不触达子系统
#[tokio::test]
async fn test_five_failures_open_circuit_and_skip_io() {
    let controller = ResilienceController::new(common::generate_unique_name("open"), &config());

    for i in 0..4 {
        let outcome = fail(&controller, Subsystem::Backplane, None).await;
        assert!(matches!(outcome, CallOutcome::Failed(_)), "call {}", i);
        assert!(!controller.is_open(Subsystem::Backplane));
    }
    fail(&controller, Subsystem::Backplane, None).await;
    assert!(matches!(
        controller.state(Subsystem::Backplane),
        CircuitState::Open { .. }
    ));
    // 另一个子系统不受影响
    assert!(!controller.is_open(Subsystem::DistributedCache));

    let io_calls = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        let calls = io_calls.clone();
        let outcome = controller
            .execute(
                Subsystem::Backplane,
                Some(RecoveryItem::new(format!("k{}", i), Action::EntryRemove, 100 + i)),
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert!(outcome.is_skipped());
    }
    assert_eq!(io_calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.queue_len(Subsystem::Backplane), 10);

    let skipped = controller
        .execute(Subsystem::Backplane, None, || async { Ok(()) })
        .await
        .into_result(Subsystem::Backplane);
    assert!(matches!(skipped, Err(CacheError::CircuitOpen(_))));
}

/// 成功的调用重置连续失败计数
#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let controller = ResilienceController::new(common::generate_unique_name("reset"), &config());
    for _ in 0..4 {
        fail(&controller, Subsystem::DistributedCache, None).await;
    }
    let ok = controller
        .execute(Subsystem::DistributedCache, None, || async { Ok(7) })
        .await;
    assert!(matches!(ok, CallOutcome::Completed(7)));
    for _ in 0..4 {
        fail(&controller, Subsystem::DistributedCache, None).await;
    }
    assert!(!controller.is_open(Subsystem::DistributedCache));
}

/// 同一键先后入队 T1 < T2，恢复后只重放 T2
#[tokio::test]
async fn test_probe_closes_circuit_and_replays_latest_only() {
    let controller = ResilienceController::new(common::generate_unique_name("replay"), &config());

    let mut target = MockTarget::new();
    target.expect_probe().times(1).returning(|| Ok(()));
    target
        .expect_replay()
        .withf(|item| item.key == "user:1" && item.timestamp == 2_000)
        .times(1)
        .returning(|_| Ok(()));
    let target = Arc::new(target);
    controller.register_target(Subsystem::Backplane, &target);

    for _ in 0..5 {
        fail(&controller, Subsystem::Backplane, None).await;
    }
    assert!(controller.is_open(Subsystem::Backplane));

    let t1 = RecoveryItem::new("user:1", Action::EntryRemove, 1_000);
    let t2 = RecoveryItem::new("user:1", Action::EntryRemove, 2_000);
    assert!(controller
        .execute(Subsystem::Backplane, Some(t1), || async { Ok(()) })
        .await
        .is_skipped());
    assert!(controller
        .execute(Subsystem::Backplane, Some(t2), || async { Ok(()) })
        .await
        .is_skipped());
    assert_eq!(controller.queue_len(Subsystem::Backplane), 1);

    assert!(controller.probe_now(Subsystem::Backplane).await);
    assert_eq!(controller.state(Subsystem::Backplane), CircuitState::Closed);
    assert_eq!(controller.queue_len(Subsystem::Backplane), 0);
}

/// 同一键的不同动作在重放前折叠为最新的一条
#[tokio::test]
async fn test_drain_collapses_to_latest_per_key() {
    let controller = ResilienceController::new(common::generate_unique_name("collapse"), &config());

    let mut target = MockTarget::new();
    target
        .expect_replay()
        .withf(|item| item.key == "a" && item.action == Action::EntryRemove && item.timestamp == 20)
        .times(1)
        .returning(|_| Ok(()));
    target
        .expect_replay()
        .withf(|item| item.key == "b" && item.timestamp == 15)
        .times(1)
        .returning(|_| Ok(()));
    let target = Arc::new(target);
    controller.register_target(Subsystem::DistributedCache, &target);

    controller.enqueue(
        Subsystem::DistributedCache,
        RecoveryItem::new("a", Action::EntrySet, 10),
    );
    controller.enqueue(
        Subsystem::DistributedCache,
        RecoveryItem::new("b", Action::EntrySet, 15),
    );
    controller.enqueue(
        Subsystem::DistributedCache,
        RecoveryItem::new("a", Action::EntryRemove, 20),
    );

    let report = controller.drain(Subsystem::DistributedCache).await;
    assert_eq!(report.replayed, 2);
    assert_eq!(report.requeued, 0);
    assert_eq!(controller.queue_len(Subsystem::DistributedCache), 0);
}

/// 探测失败时熔断保持打开，队列保留
#[tokio::test]
async fn test_failed_probe_keeps_circuit_open() {
    let controller = ResilienceController::new(common::generate_unique_name("probe_fail"), &config());

    let mut target = MockTarget::new();
    target
        .expect_probe()
        .times(1)
        .returning(|| Err(CacheError::Backplane("still down".to_string())));
    target.expect_replay().never();
    let target = Arc::new(target);
    controller.register_target(Subsystem::Backplane, &target);

    for _ in 0..5 {
        fail(
            &controller,
            Subsystem::Backplane,
            Some(RecoveryItem::new("k", Action::EntrySet, 1)),
        )
        .await;
    }
    assert!(!controller.probe_now(Subsystem::Backplane).await);
    assert!(controller.is_open(Subsystem::Backplane));
    assert_eq!(controller.queue_len(Subsystem::Backplane), 1);

    // 熔断打开期间不重放
    let report = controller.drain(Subsystem::Backplane).await;
    assert_eq!(report.replayed, 0);
    assert_eq!(controller.queue_len(Subsystem::Backplane), 1);
}

/// 被取消的调用不计入熔断，也不入队
#[tokio::test]
async fn test_cancellation_is_neutral() {
    let controller = ResilienceController::new(common::generate_unique_name("cancel"), &config());
    for _ in 0..10 {
        let outcome = controller
            .execute(
                Subsystem::Backplane,
                Some(RecoveryItem::new("k", Action::EntrySet, 1)),
                || async { Err::<(), _>(CacheError::Cancelled) },
            )
            .await;
        assert!(matches!(outcome, CallOutcome::Failed(CacheError::Cancelled)));
    }
    assert!(!controller.is_open(Subsystem::Backplane));
    assert_eq!(controller.queue_len(Subsystem::Backplane), 0);
}

/// 后台探测任务自动关闭熔断器并清空队列
#[tokio::test]
async fn test_background_prober_recovers() {
    let controller = ResilienceController::new(
        common::generate_unique_name("prober"),
        &ResilienceConfig {
            failure_threshold: 2,
            probe_interval_ms: 20,
            ..Default::default()
        },
    );

    let probes = Arc::new(AtomicUsize::new(0));
    let mut target = MockTarget::new();
    {
        let probes = probes.clone();
        target.expect_probe().returning(move || {
            // 前两次探测仍然失败
            if probes.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CacheError::Backplane("down".to_string()))
            } else {
                Ok(())
            }
        });
    }
    target.expect_replay().times(1).returning(|_| Ok(()));
    let target = Arc::new(target);
    controller.register_target(Subsystem::Backplane, &target);
    controller.start_prober();

    for _ in 0..2 {
        fail(
            &controller,
            Subsystem::Backplane,
            Some(RecoveryItem::new("k", Action::EntryExpire, 5)),
        )
        .await;
    }
    assert!(controller.is_open(Subsystem::Backplane));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while controller.is_open(Subsystem::Backplane) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!controller.is_open(Subsystem::Backplane));
    assert!(probes.load(Ordering::SeqCst) >= 3);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while controller.queue_len(Subsystem::Backplane) > 0 && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(controller.queue_len(Subsystem::Backplane), 0);

    controller.shutdown().await;
}

/// 阻塞入口与异步入口共享同一个熔断器
#[test]
fn test_blocking_calls_share_breaker() {
    let controller = ResilienceController::new(common::generate_unique_name("blocking"), &config());
    for _ in 0..5 {
        let outcome = controller.execute_blocking(
            Subsystem::DistributedCache,
            Some(RecoveryItem::new("k", Action::EntrySet, 3)),
            || Err::<(), _>(CacheError::Timeout("slow".to_string())),
        );
        assert!(matches!(outcome, CallOutcome::Failed(CacheError::Timeout(_))));
    }
    assert!(controller.is_open(Subsystem::DistributedCache));

    let called = AtomicUsize::new(0);
    let outcome = controller.execute_blocking(Subsystem::DistributedCache, None, || {
        called.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert!(outcome.is_skipped());
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(controller.queue_len(Subsystem::DistributedCache), 1);
}
