//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 全局指标测试，共享全局状态，必须串行执行

#[path = "../common/mod.rs"]
mod common;

use common::RecordingHandler;
use oxcache_backplane::backplane::{Backplane, BackplaneOptions, MemoryBackplane, MemoryHub};
use oxcache_backplane::config::ResilienceConfig;
use oxcache_backplane::error::CacheError;
use oxcache_backplane::lock::StripedLocker;
use oxcache_backplane::metrics::{get_metrics_string, GLOBAL_METRICS};
use oxcache_backplane::protocol::InvalidationMessage;
use oxcache_backplane::recovery::{ResilienceController, Subsystem};
use oxcache_backplane::utils::create_memory_backplane_config;
use oxcache_backplane::CacheRegistry;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[serial]
async fn test_backplane_receive_counters() {
    GLOBAL_METRICS.set_enabled(true);
    let cache = common::generate_unique_name("metrics_bp");
    let hub = Arc::new(MemoryHub::new());
    let a = MemoryBackplane::new(BackplaneOptions::new(&cache, "A"), hub.clone());
    let b = MemoryBackplane::new(BackplaneOptions::new(&cache, "B"), hub.clone());
    let listener = Arc::new(common::RecordingListener::default());
    b.subscribe(listener.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    a.publish(&InvalidationMessage::entry_set("A", 1, "k"), &cancel)
        .await
        .unwrap();
    a.publish(&InvalidationMessage::entry_set("A", 0, "k"), &cancel)
        .await
        .unwrap();
    assert!(listener.wait_for(1, Duration::from_secs(2)).await);

    assert_eq!(GLOBAL_METRICS.counter(&cache, "backplane", "publish"), 2);
    assert_eq!(GLOBAL_METRICS.counter(&cache, "backplane", "receive"), 1);
    assert_eq!(GLOBAL_METRICS.counter(&cache, "backplane", "receive_invalid"), 1);
    assert_eq!(GLOBAL_METRICS.counter(&cache, "backplane", "connect"), 1);

    GLOBAL_METRICS.remove_cache(&cache);
    assert_eq!(GLOBAL_METRICS.counter(&cache, "backplane", "publish"), 0);
}

#[tokio::test]
#[serial]
async fn test_circuit_gauge_is_rendered() {
    GLOBAL_METRICS.set_enabled(true);
    let cache = common::generate_unique_name("metrics_circuit");
    let controller = ResilienceController::new(
        &cache,
        &ResilienceConfig {
            failure_threshold: 1,
            probe_interval_ms: 60_000,
            ..Default::default()
        },
    );
    controller
        .execute(Subsystem::DistributedCache, None, || async {
            Err::<(), _>(CacheError::Timeout("slow".to_string()))
        })
        .await;
    assert!(controller.is_open(Subsystem::DistributedCache));

    let text = get_metrics_string();
    assert!(text.contains(&format!(
        "backplane_circuit_open{{cache=\"{}\", subsystem=\"distributed_cache\"}} 1",
        cache
    )));
    assert_eq!(
        GLOBAL_METRICS.counter(&cache, "distributed_cache", "circuit_opened"),
        1
    );
    GLOBAL_METRICS.remove_cache(&cache);
}

#[tokio::test]
#[serial]
async fn test_disabled_metrics_record_nothing() {
    GLOBAL_METRICS.set_enabled(false);
    let cache = common::generate_unique_name("metrics_off");
    let locker = StripedLocker::new(&cache, 16);
    let token = locker
        .acquire("k", Duration::ZERO, &CancellationToken::new())
        .await;
    assert!(token.is_some());
    assert_eq!(GLOBAL_METRICS.counter(&cache, "local_lock", "acquired"), 0);

    GLOBAL_METRICS.set_enabled(true);
    drop(token);
    let _token = locker
        .acquire("k", Duration::ZERO, &CancellationToken::new())
        .await;
    assert_eq!(GLOBAL_METRICS.counter(&cache, "local_lock", "acquired"), 1);
    GLOBAL_METRICS.remove_cache(&cache);
}

/// 注册表初始化按全局配置开关指标
#[tokio::test]
#[serial]
async fn test_registry_init_applies_metrics_switch() {
    let config = oxcache_backplane::Config::from_toml_str(
        r#"
        [global]
        enable_metrics = false
        "#,
    )
    .unwrap();
    let registry = CacheRegistry::new();
    registry.init(&config, Default::default()).await.unwrap();
    assert!(!GLOBAL_METRICS.is_enabled());

    GLOBAL_METRICS.set_enabled(true);
    let cache = common::generate_unique_name("metrics_applied");
    let handler = Arc::new(RecordingHandler::default());
    let hub = registry.hub().clone();
    let mut config_b = create_memory_backplane_config();
    config_b.instance_id = Some("B".to_string());
    registry
        .build(&cache, config_b, Some(handler.clone()))
        .await
        .unwrap();

    let peer = MemoryBackplane::new(BackplaneOptions::new(&cache, "A"), hub);
    peer.publish(
        &InvalidationMessage::entry_remove("A", 5, "k"),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(handler.wait_for(1, Duration::from_secs(2)).await);
    // 处理器在监听任务中执行，计数紧随其后
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(GLOBAL_METRICS.counter(&cache, "invalidation", "applied"), 1);

    registry.shutdown_all().await.unwrap();
    GLOBAL_METRICS.remove_cache(&cache);
}
