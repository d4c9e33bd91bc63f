//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存注册表，负责按配置构建、保存和关闭缓存节点。
//!
//! 每个 [`CacheNode`] 在同一 `(cache_name, instance_id)` 身份下组合本地锁、
//! 分布式锁、背板、弹性控制器以及失效的发布者和订阅者。

use crate::backend::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::backplane::{
    Backplane, BackplaneOptions, MemoryBackplane, MemoryHub, NullBackplane, RedisBackplane,
};
use crate::config::{BackplaneKind, CacheConfig, Config, LockKind};
use crate::error::{CacheError, Result};
use crate::lock::{
    BlockingLocker, DistributedLockToken, DistributedLocker, LocalLockToken, MemoryLocker,
    NullLocker, RedisLocker, StripedLocker,
};
use crate::metrics::GLOBAL_METRICS;
use crate::protocol::Action;
use crate::recovery::{ResilienceController, Subsystem};
use crate::sync::{InvalidationHandler, InvalidationPublisher, InvalidationSubscriber, TimestampSource};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// 分布式锁的具体实现
#[derive(Clone)]
pub enum DistributedLockVariant {
    Null(NullLocker),
    Memory(Arc<MemoryLocker>),
    Redis(Arc<RedisLocker>),
}

impl DistributedLockVariant {
    /// 以 trait 对象形式共享，供阻塞门面使用
    pub fn shared(&self) -> Arc<dyn DistributedLocker> {
        match self {
            DistributedLockVariant::Null(locker) => Arc::new(locker.clone()),
            DistributedLockVariant::Memory(locker) => locker.clone(),
            DistributedLockVariant::Redis(locker) => locker.clone(),
        }
    }
}

#[async_trait]
impl DistributedLocker for DistributedLockVariant {
    fn kind(&self) -> &'static str {
        match self {
            DistributedLockVariant::Null(locker) => locker.kind(),
            DistributedLockVariant::Memory(locker) => locker.kind(),
            DistributedLockVariant::Redis(locker) => locker.kind(),
        }
    }

    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<DistributedLockToken> {
        match self {
            DistributedLockVariant::Null(locker) => locker.acquire(key, timeout, cancel).await,
            DistributedLockVariant::Memory(locker) => locker.acquire(key, timeout, cancel).await,
            DistributedLockVariant::Redis(locker) => locker.acquire(key, timeout, cancel).await,
        }
    }

    async fn release(&self, token: DistributedLockToken) {
        match self {
            DistributedLockVariant::Null(locker) => locker.release(token).await,
            DistributedLockVariant::Memory(locker) => locker.release(token).await,
            DistributedLockVariant::Redis(locker) => locker.release(token).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            DistributedLockVariant::Null(locker) => locker.shutdown().await,
            DistributedLockVariant::Memory(locker) => locker.shutdown().await,
            DistributedLockVariant::Redis(locker) => locker.shutdown().await,
        }
    }
}

/// 缓存节点
pub struct CacheNode {
    cache_name: String,
    instance_id: String,
    local: StripedLocker,
    distributed: DistributedLockVariant,
    backplane: Arc<dyn Backplane>,
    controller: ResilienceController,
    /// 控制器只弱引用发布者，由节点持有
    publisher: Arc<InvalidationPublisher>,
    subscribed: bool,
}

impl CacheNode {
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn backplane(&self) -> &Arc<dyn Backplane> {
        &self.backplane
    }

    /// 弹性控制器
    ///
    /// 缓存引擎通过 [`ResilienceController::register_target`] 为
    /// [`Subsystem::DistributedCache`] 注册自己的探测和重放入口。
    pub fn controller(&self) -> &ResilienceController {
        &self.controller
    }

    pub fn publisher(&self) -> &InvalidationPublisher {
        &self.publisher
    }

    pub fn local_locker(&self) -> &StripedLocker {
        &self.local
    }

    pub fn distributed_locker(&self) -> &DistributedLockVariant {
        &self.distributed
    }

    /// 分布式锁的阻塞门面
    pub fn blocking_locker(&self, handle: tokio::runtime::Handle) -> BlockingLocker {
        BlockingLocker::new(self.distributed.shared(), handle)
    }

    /// 通知其他节点：条目被写入
    pub async fn notify_set(&self, key: &str) -> Result<()> {
        self.publisher.publish(Action::EntrySet, key).await
    }

    /// 通知其他节点：条目被删除
    pub async fn notify_remove(&self, key: &str) -> Result<()> {
        self.publisher.publish(Action::EntryRemove, key).await
    }

    /// 通知其他节点：条目被标记过期
    pub async fn notify_expire(&self, key: &str) -> Result<()> {
        self.publisher.publish(Action::EntryExpire, key).await
    }

    /// 获取进程内锁
    pub async fn lock_local(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<LocalLockToken> {
        self.local.acquire(key, timeout, cancel).await
    }

    /// 获取分布式锁
    pub async fn lock_distributed(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<DistributedLockToken> {
        self.distributed.acquire(key, timeout, cancel).await
    }

    pub async fn release_distributed(&self, token: DistributedLockToken) {
        self.distributed.release(token).await
    }

    /// 关闭节点：取消订阅，停止探测和后台任务
    #[instrument(skip(self), level = "info", fields(cache = %self.cache_name, instance = %self.instance_id))]
    pub async fn shutdown(&self) -> Result<()> {
        self.publisher.shutdown();
        self.controller.shutdown().await;
        self.distributed.shutdown().await;
        if self.subscribed {
            self.backplane.unsubscribe().await?;
        }
        info!("cache node stopped");
        Ok(())
    }
}

/// 未调用 `shutdown` 就被释放的节点同样停止后台任务，背板在最后一个引用
/// 释放时退订
impl Drop for CacheNode {
    fn drop(&mut self) {
        self.publisher.shutdown();
        self.controller.stop_prober();
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("cache_name", &self.cache_name)
            .field("instance_id", &self.instance_id)
            .field("backplane", &self.backplane.kind())
            .field("distributed_lock", &self.distributed.kind())
            .finish()
    }
}

/// 缓存节点构建器
pub struct NodeBuilder {
    cache_name: String,
    config: CacheConfig,
    handler: Option<Arc<dyn InvalidationHandler>>,
    hub: Option<Arc<MemoryHub>>,
    redis_provider: Arc<dyn RedisProvider>,
}

impl NodeBuilder {
    pub fn new(cache_name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            cache_name: cache_name.into(),
            config,
            handler: None,
            hub: None,
            redis_provider: Arc::new(DefaultRedisProvider),
        }
    }

    /// 本地失效处理器，启用背板时必填
    pub fn with_handler(mut self, handler: Arc<dyn InvalidationHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 进程内背板使用的频道中心
    pub fn with_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_redis_provider(mut self, provider: Arc<dyn RedisProvider>) -> Self {
        self.redis_provider = provider;
        self
    }

    fn build_backplane(&self, options: BackplaneOptions) -> Result<Arc<dyn Backplane>> {
        Ok(match self.config.backplane.kind {
            BackplaneKind::None => Arc::new(NullBackplane::new(options)),
            BackplaneKind::Memory => {
                let hub = self.hub.clone().ok_or_else(|| {
                    CacheError::ConfigError(format!(
                        "Cache '{}' uses a memory backplane without a hub",
                        self.cache_name
                    ))
                })?;
                Arc::new(MemoryBackplane::new(options, hub))
            }
            BackplaneKind::Redis => Arc::new(RedisBackplane::with_provider(
                options,
                &self.config.backplane,
                self.redis_provider.clone(),
            )?),
        })
    }

    fn build_locker(&self) -> Result<DistributedLockVariant> {
        let lock = &self.config.distributed_lock;
        Ok(match lock.kind {
            LockKind::None => DistributedLockVariant::Null(NullLocker),
            LockKind::Memory => {
                DistributedLockVariant::Memory(Arc::new(MemoryLocker::new(&self.cache_name, lock)))
            }
            LockKind::Redis => DistributedLockVariant::Redis(Arc::new(RedisLocker::with_provider(
                &self.cache_name,
                lock,
                self.redis_provider.clone(),
            )?)),
        })
    }

    /// 构建节点并订阅背板
    #[instrument(skip(self), level = "info", fields(cache = %self.cache_name))]
    pub async fn build(self) -> Result<CacheNode> {
        self.config
            .validate(&self.cache_name)
            .map_err(CacheError::ConfigError)?;

        let backplane_enabled = self.config.backplane.kind != BackplaneKind::None;
        if backplane_enabled && self.handler.is_none() {
            return Err(CacheError::ConfigError(format!(
                "Cache '{}' enables a backplane but has no invalidation handler",
                self.cache_name
            )));
        }

        let instance_id = self
            .config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut options = BackplaneOptions::new(&self.cache_name, &instance_id);
        if let Some(prefix) = &self.config.channel_prefix {
            options = options.with_channel_prefix(prefix);
        }
        options.validate()?;

        let backplane = self.build_backplane(options)?;
        let distributed = self.build_locker()?;
        let controller = ResilienceController::new(&self.cache_name, &self.config.resilience);
        let publisher = Arc::new(InvalidationPublisher::new(
            backplane.clone(),
            controller.clone(),
            Arc::new(TimestampSource::new()),
            self.config.invalidation.background_publish,
        ));
        controller.register_target(Subsystem::Backplane, &publisher);

        if let Some(handler) = self.handler.clone().filter(|_| backplane_enabled) {
            let invalidation = &self.config.invalidation;
            let subscriber = InvalidationSubscriber::new(
                &self.cache_name,
                handler,
                controller.clone(),
                invalidation
                    .ignore_stale
                    .then_some(invalidation.stale_tracking_capacity),
            );
            backplane.subscribe(Arc::new(subscriber)).await?;
        }
        controller.start_prober();

        info!(
            instance = %instance_id,
            backplane = backplane.kind(),
            distributed_lock = distributed.kind(),
            "cache node started"
        );

        Ok(CacheNode {
            local: StripedLocker::new(&self.cache_name, self.config.local_lock.stripes),
            cache_name: self.cache_name,
            instance_id,
            distributed,
            backplane,
            controller,
            publisher,
            subscribed: backplane_enabled,
        })
    }
}

/// 缓存注册表
///
/// 显式创建并按依赖传递；持有进程内背板共用的 [`MemoryHub`]。
pub struct CacheRegistry {
    hub: Arc<MemoryHub>,
    nodes: DashMap<String, Arc<CacheNode>>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::with_hub(Arc::new(MemoryHub::new()))
    }

    /// 与其他注册表共享频道中心，用于在一个进程内模拟多个节点
    pub fn with_hub(hub: Arc<MemoryHub>) -> Self {
        Self {
            hub,
            nodes: DashMap::new(),
        }
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    /// 创建已绑定本注册表频道中心的构建器
    pub fn builder(&self, cache_name: impl Into<String>, config: CacheConfig) -> NodeBuilder {
        NodeBuilder::new(cache_name, config).with_hub(self.hub.clone())
    }

    /// 注册已构建的节点，同名节点已存在时返回错误
    pub fn register(&self, node: CacheNode) -> Result<Arc<CacheNode>> {
        let node = Arc::new(node);
        match self.nodes.entry(node.cache_name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CacheError::ConfigError(format!(
                "Cache '{}' is already registered",
                node.cache_name()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node.clone());
                Ok(node)
            }
        }
    }

    /// 构建并注册一个节点
    pub async fn build(
        &self,
        cache_name: &str,
        config: CacheConfig,
        handler: Option<Arc<dyn InvalidationHandler>>,
    ) -> Result<Arc<CacheNode>> {
        if self.nodes.contains_key(cache_name) {
            return Err(CacheError::ConfigError(format!(
                "Cache '{}' is already registered",
                cache_name
            )));
        }
        let mut builder = self.builder(cache_name, config);
        if let Some(handler) = handler {
            builder = builder.with_handler(handler);
        }
        let node = builder.build().await?;
        self.register(node)
    }

    /// 按配置文件构建全部节点
    ///
    /// `handlers` 按缓存名称提供失效处理器。
    #[instrument(skip(self, config, handlers), level = "info", fields(cache_count = config.caches.len()))]
    pub async fn init(
        &self,
        config: &Config,
        mut handlers: HashMap<String, Arc<dyn InvalidationHandler>>,
    ) -> Result<()> {
        config.validate().map_err(CacheError::ConfigError)?;
        GLOBAL_METRICS.set_enabled(config.global.enable_metrics);

        for (name, cache) in &config.caches {
            self.build(name, cache.clone(), handlers.remove(name)).await?;
        }
        Ok(())
    }

    pub fn get(&self, cache_name: &str) -> Option<Arc<CacheNode>> {
        self.nodes.get(cache_name).map(|node| node.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 关闭并移除一个节点
    pub async fn shutdown(&self, cache_name: &str) -> Result<()> {
        match self.nodes.remove(cache_name) {
            Some((_, node)) => node.shutdown().await,
            None => Err(CacheError::ConfigError(format!(
                "Cache '{}' is not registered",
                cache_name
            ))),
        }
    }

    /// 关闭全部节点
    #[instrument(skip(self), level = "info")]
    pub async fn shutdown_all(&self) -> Result<()> {
        let nodes: Vec<(String, Arc<CacheNode>)> = self
            .nodes
            .iter()
            .map(|node| (node.key().clone(), node.value().clone()))
            .collect();
        self.nodes.clear();

        let mut errors = Vec::new();
        for (name, node) in nodes {
            if let Err(e) = node.shutdown().await {
                warn!(cache = %name, error = %e, "cache node shutdown failed");
                errors.push(format!("{}: {}", name, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::ShutdownError(format!(
                "some cache nodes failed to shut down: {}",
                errors.join(", ")
            )))
        }
    }
}
