//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 缓存节点与注册表的端到端测试

#[path = "../common/mod.rs"]
mod common;

use common::RecordingHandler;
use oxcache_backplane::config::{Config, LockKind};
use oxcache_backplane::error::CacheError;
use oxcache_backplane::protocol::Action;
use oxcache_backplane::recovery::Subsystem;
use oxcache_backplane::sync::InvalidationHandler;
use oxcache_backplane::utils::create_memory_backplane_config;
use oxcache_backplane::{Backplane, CacheRegistry, DistributedLocker, MemoryHub, NodeBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 两个共享频道中心的注册表，模拟同一逻辑缓存的两个节点
async fn two_nodes(
    cache: &str,
) -> (
    CacheRegistry,
    CacheRegistry,
    Arc<RecordingHandler>,
    Arc<RecordingHandler>,
) {
    let hub = Arc::new(MemoryHub::new());
    let registry_a = CacheRegistry::with_hub(hub.clone());
    let registry_b = CacheRegistry::with_hub(hub);
    let handler_a = Arc::new(RecordingHandler::default());
    let handler_b = Arc::new(RecordingHandler::default());

    let mut config_a = create_memory_backplane_config();
    config_a.instance_id = Some("A".to_string());
    let mut config_b = create_memory_backplane_config();
    config_b.instance_id = Some("B".to_string());

    registry_a
        .build(cache, config_a, Some(handler_a.clone()))
        .await
        .unwrap();
    registry_b
        .build(cache, config_b, Some(handler_b.clone()))
        .await
        .unwrap();
    (registry_a, registry_b, handler_a, handler_b)
}

/// 节点 A 删除条目，节点 B 在本地应用失效，A 自己不会收到
#[tokio::test]
async fn test_remove_propagates_to_peer_only() {
    common::setup_logging();
    let cache = common::generate_unique_name("orders");
    let (registry_a, registry_b, handler_a, handler_b) = two_nodes(&cache).await;

    let node_a = registry_a.get(&cache).unwrap();
    node_a.notify_remove("user:1").await.unwrap();

    assert!(handler_b.wait_for(1, Duration::from_secs(2)).await);
    let applied = handler_b.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].action(), Action::EntryRemove);
    assert_eq!(applied[0].cache_key(), "user:1");
    assert_eq!(applied[0].source_id(), "A");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler_a.applied().is_empty());

    registry_a.shutdown_all().await.unwrap();
    registry_b.shutdown_all().await.unwrap();
}

/// 双向传播，每个节点只收到对方的消息
#[tokio::test]
async fn test_bidirectional_invalidation() {
    let cache = common::generate_unique_name("profiles");
    let (registry_a, registry_b, handler_a, handler_b) = two_nodes(&cache).await;

    let node_a = registry_a.get(&cache).unwrap();
    let node_b = registry_b.get(&cache).unwrap();
    node_a.notify_set("a:1").await.unwrap();
    node_b.notify_expire("b:1").await.unwrap();
    node_b.notify_remove("b:2").await.unwrap();

    assert!(handler_a.wait_for(2, Duration::from_secs(2)).await);
    assert!(handler_b.wait_for(1, Duration::from_secs(2)).await);

    let mut keys_a: Vec<String> = handler_a
        .applied()
        .iter()
        .map(|m| m.cache_key().to_string())
        .collect();
    keys_a.sort();
    assert_eq!(keys_a, vec!["b:1", "b:2"]);
    assert!(handler_a.applied().iter().all(|m| m.source_id() == "B"));
    assert_eq!(handler_b.applied()[0].cache_key(), "a:1");

    registry_a.shutdown_all().await.unwrap();
    registry_b.shutdown_all().await.unwrap();
}

/// 未调用 shutdown 直接释放的节点同样退订，不再应用失效
#[tokio::test]
async fn test_dropped_node_unsubscribes() {
    let cache = common::generate_unique_name("dropped");
    let hub = Arc::new(MemoryHub::new());
    let handler_a = Arc::new(RecordingHandler::default());
    let handler_b = Arc::new(RecordingHandler::default());

    let node_a = NodeBuilder::new(&cache, create_memory_backplane_config())
        .with_instance_id("A")
        .with_hub(hub.clone())
        .with_handler(handler_a.clone())
        .build()
        .await
        .unwrap();
    let node_b = NodeBuilder::new(&cache, create_memory_backplane_config())
        .with_instance_id("B")
        .with_hub(hub.clone())
        .with_handler(handler_b.clone())
        .build()
        .await
        .unwrap();
    let channel = node_a.backplane().options().channel();
    assert_eq!(hub.subscriber_count(&channel), 2);

    drop(node_b);
    assert_eq!(hub.subscriber_count(&channel), 1);

    node_a.notify_remove("k").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handler_b.applied().is_empty());

    node_a.shutdown().await.unwrap();
    drop(node_a);
    assert_eq!(hub.subscriber_count(&channel), 0);
}

/// 注册失败时已构建的节点随之释放，不会残留订阅
#[tokio::test]
async fn test_rejected_registration_releases_node() {
    let cache = common::generate_unique_name("rejected");
    let registry = CacheRegistry::new();
    let handler = Arc::new(RecordingHandler::default());

    let first = registry
        .builder(&cache, create_memory_backplane_config())
        .with_handler(handler.clone())
        .build()
        .await
        .unwrap();
    let channel = first.backplane().options().channel();
    registry.register(first).unwrap();

    let second = registry
        .builder(&cache, create_memory_backplane_config())
        .with_handler(handler.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(registry.hub().subscriber_count(&channel), 2);
    assert!(matches!(
        registry.register(second),
        Err(CacheError::ConfigError(_))
    ));
    assert_eq!(registry.hub().subscriber_count(&channel), 1);

    registry.shutdown_all().await.unwrap();
}

/// 关闭后的节点不再收到消息
#[tokio::test]
async fn test_shutdown_stops_delivery() {
    let cache = common::generate_unique_name("stop");
    let (registry_a, registry_b, _handler_a, handler_b) = two_nodes(&cache).await;

    registry_b.shutdown(&cache).await.unwrap();
    assert!(registry_b.get(&cache).is_none());
    assert!(matches!(
        registry_b.shutdown(&cache).await,
        Err(CacheError::ConfigError(_))
    ));

    registry_a
        .get(&cache)
        .unwrap()
        .notify_remove("k")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handler_b.applied().is_empty());

    registry_a.shutdown_all().await.unwrap();
}

/// 启用背板但缺少失效处理器是配置错误
#[tokio::test]
async fn test_missing_handler_is_config_error() {
    let registry = CacheRegistry::new();
    let result = registry
        .build("no_handler", create_memory_backplane_config(), None)
        .await;
    assert!(matches!(result, Err(CacheError::ConfigError(_))));
    assert!(registry.is_empty());
}

/// 未启用背板的节点可以没有处理器，发布是无操作
#[tokio::test]
async fn test_node_without_backplane() {
    let registry = CacheRegistry::new();
    let node = registry
        .build("standalone", Default::default(), None)
        .await
        .unwrap();
    assert_eq!(node.backplane().kind(), "none");
    node.notify_set("k").await.unwrap();
    assert!(!node.controller().is_open(Subsystem::Backplane));

    // 未配置分布式锁时获取总是返回 None，调用方照常执行
    assert!(node
        .lock_distributed("k", Duration::from_millis(10), &CancellationToken::new())
        .await
        .is_none());
    registry.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let registry = CacheRegistry::new();
    let handler: Arc<dyn InvalidationHandler> = Arc::new(RecordingHandler::default());
    registry
        .build("dup", create_memory_backplane_config(), Some(handler.clone()))
        .await
        .unwrap();
    let second = registry
        .build("dup", create_memory_backplane_config(), Some(handler))
        .await;
    assert!(matches!(second, Err(CacheError::ConfigError(_))));
    assert_eq!(registry.names(), vec!["dup".to_string()]);
    registry.shutdown_all().await.unwrap();
}

/// 空键在发布前被拒绝
#[tokio::test]
async fn test_invalid_keys_are_rejected_before_publish() {
    let cache = common::generate_unique_name("keys");
    let (registry_a, registry_b, _handler_a, handler_b) = two_nodes(&cache).await;
    let node_a = registry_a.get(&cache).unwrap();

    assert!(matches!(
        node_a.notify_remove("").await,
        Err(CacheError::Misuse(_))
    ));
    assert!(matches!(
        node_a.notify_set("bad\nkey").await,
        Err(CacheError::Misuse(_))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler_b.applied().is_empty());

    registry_a.shutdown_all().await.unwrap();
    registry_b.shutdown_all().await.unwrap();
}

/// 通过TOML配置初始化多个缓存
#[tokio::test]
async fn test_init_from_config() {
    let raw = r#"
        config_version = 1

        [global]
        enable_metrics = true

        [caches.orders]
        instance_id = "node-1"

        [caches.orders.backplane]
        kind = "memory"

        [caches.orders.distributed_lock]
        kind = "memory"
        abandon_timeout_ms = 1000
        idle_eviction_ms = 60000

        [caches.sessions]
        channel_prefix = "shared"

        [caches.sessions.local_lock]
        stripes = 64
    "#;
    let config = Config::from_toml_str(raw).unwrap();

    let registry = CacheRegistry::new();
    let mut handlers: HashMap<String, Arc<dyn InvalidationHandler>> = HashMap::new();
    handlers.insert("orders".to_string(), Arc::new(RecordingHandler::default()));
    registry.init(&config, handlers).await.unwrap();

    let mut names = registry.names();
    names.sort();
    assert_eq!(names, vec!["orders", "sessions"]);

    let orders = registry.get("orders").unwrap();
    assert_eq!(orders.instance_id(), "node-1");
    assert_eq!(orders.backplane().kind(), "memory");
    assert_eq!(orders.distributed_locker().kind(), "memory");
    assert_eq!(
        config.caches["orders"].distributed_lock.kind,
        LockKind::Memory
    );

    let cancel = CancellationToken::new();
    let token = orders
        .lock_distributed("order:9", Duration::from_millis(100), &cancel)
        .await
        .unwrap();
    assert!(orders
        .lock_distributed("order:9", Duration::from_millis(20), &cancel)
        .await
        .is_none());
    orders.release_distributed(token).await;
    assert!(orders
        .lock_distributed("order:9", Duration::from_millis(20), &cancel)
        .await
        .is_some());

    let sessions = registry.get("sessions").unwrap();
    assert_eq!(sessions.local_locker().stripe_count(), 64);
    let local = sessions
        .lock_local("s:1", Duration::from_millis(10), &cancel)
        .await;
    assert!(local.is_some());

    registry.shutdown_all().await.unwrap();
    assert!(registry.is_empty());
}
