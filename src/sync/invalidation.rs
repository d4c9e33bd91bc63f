//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存失效的发布与订阅，连接背板、弹性控制器和本地缓存。

use super::clock::TimestampSource;
use crate::backplane::{Backplane, BackplaneListener};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::protocol::{Action, InvalidationMessage};
use crate::recovery::{CallOutcome, RecoveryItem, RecoveryTarget, ResilienceController, Subsystem};
use crate::utils::redaction::redact_cache_key;
use crate::utils::validate_cache_key;
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// 本地失效处理器，由缓存引擎实现
#[async_trait]
pub trait InvalidationHandler: Send + Sync {
    /// 在本地应用一条远端失效
    async fn apply(&self, message: &InvalidationMessage) -> Result<()>;

    /// 背板重连后调用，此时可能已错过部分消息
    async fn on_resync(&self) {}
}

/// 缓存失效发布者
///
/// 通过弹性控制器向背板发布，可廉价克隆。
#[derive(Clone)]
pub struct InvalidationPublisher {
    cache_name: Arc<str>,
    instance_id: Arc<str>,
    backplane: Arc<dyn Backplane>,
    controller: ResilienceController,
    clock: Arc<TimestampSource>,
    background: bool,
    shutdown: CancellationToken,
}

impl InvalidationPublisher {
    /// 创建新的失效发布者
    ///
    /// # 参数
    ///
    /// * `backplane` - 背板，身份信息取自其配置
    /// * `controller` - 弹性控制器
    /// * `clock` - 节点时间戳来源
    /// * `background` - 是否后台发布
    pub fn new(
        backplane: Arc<dyn Backplane>,
        controller: ResilienceController,
        clock: Arc<TimestampSource>,
        background: bool,
    ) -> Self {
        let options = backplane.options();
        Self {
            cache_name: Arc::from(options.cache_name.as_str()),
            instance_id: Arc::from(options.instance_id.as_str()),
            backplane,
            controller,
            clock,
            background,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// 以本节点身份构造消息
    pub fn message(&self, action: Action, key: &str) -> InvalidationMessage {
        InvalidationMessage::new(self.instance_id.as_ref(), self.clock.now(), action, key)
    }

    /// 发布失效
    ///
    /// 后台模式下立即返回，结果只体现在弹性控制器中。
    pub async fn publish(&self, action: Action, key: &str) -> Result<()> {
        validate_cache_key(key)?;
        let message = self.message(action, key);
        if self.background {
            let publisher = self.clone();
            tokio::spawn(async move {
                let cancel = publisher.shutdown.child_token();
                publisher.send(message, &cancel).await;
            });
            return Ok(());
        }
        let cancel = self.shutdown.child_token();
        self.send(message, &cancel)
            .await
            .into_result(Subsystem::Backplane)
    }

    /// 等待发布结果
    pub async fn publish_awaited(
        &self,
        action: Action,
        key: &str,
        cancel: &CancellationToken,
    ) -> CallOutcome<()> {
        if let Err(e) = validate_cache_key(key) {
            return CallOutcome::Failed(e);
        }
        self.send(self.message(action, key), cancel).await
    }

    /// 阻塞发布
    pub fn publish_blocking(&self, action: Action, key: &str) -> Result<()> {
        validate_cache_key(key)?;
        let message = self.message(action, key);
        let item = RecoveryItem::new(key, action, message.timestamp());
        self.controller
            .execute_blocking(Subsystem::Backplane, Some(item), || {
                self.backplane.publish_blocking(&message)
            })
            .into_result(Subsystem::Backplane)
    }

    #[instrument(
        skip(self, message, cancel),
        level = "debug",
        fields(cache = %self.cache_name, action = %message.action(), key = %redact_cache_key(message.cache_key()))
    )]
    async fn send(&self, message: InvalidationMessage, cancel: &CancellationToken) -> CallOutcome<()> {
        let item = message
            .action()
            .requires_key()
            .then(|| RecoveryItem::new(message.cache_key(), message.action(), message.timestamp()));
        self.controller
            .execute(Subsystem::Backplane, item, || {
                self.backplane.publish(&message, cancel)
            })
            .await
    }

    /// 发送一条哨兵消息，不经过熔断器
    pub async fn send_sentinel(&self, cancel: &CancellationToken) -> Result<()> {
        let sentinel = InvalidationMessage::sentinel(self.instance_id.as_ref(), self.clock.now());
        self.backplane.publish(&sentinel, cancel).await
    }

    /// 取消尚未完成的后台发布
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl RecoveryTarget for InvalidationPublisher {
    async fn probe(&self) -> Result<()> {
        self.send_sentinel(&self.shutdown.child_token()).await
    }

    async fn replay(&self, item: &RecoveryItem) -> Result<()> {
        let message = InvalidationMessage::new(
            self.instance_id.as_ref(),
            item.timestamp,
            item.action,
            item.key.as_str(),
        );
        if !message.is_valid() {
            return Err(CacheError::Misuse(format!(
                "recovery item for action {} is not replayable",
                item.action
            )));
        }
        self.backplane
            .publish(&message, &self.shutdown.child_token())
            .await
    }
}

/// 缓存失效订阅者，即节点的背板监听者
pub struct InvalidationSubscriber {
    cache_name: String,
    handler: Arc<dyn InvalidationHandler>,
    controller: ResilienceController,
    /// 每个键最近应用的时间戳，None 表示不做过期判断
    applied: Option<Cache<String, i64>>,
}

impl InvalidationSubscriber {
    /// 创建新的失效订阅者
    ///
    /// `stale_tracking_capacity` 为 None 时关闭按键最后写入者胜出的过滤。
    pub fn new(
        cache_name: impl Into<String>,
        handler: Arc<dyn InvalidationHandler>,
        controller: ResilienceController,
        stale_tracking_capacity: Option<u64>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            handler,
            controller,
            applied: stale_tracking_capacity.map(|capacity| Cache::builder().max_capacity(capacity).build()),
        }
    }

    /// 是否比该键已应用的消息更旧
    ///
    /// 比较与更新在同一个条目计算中完成，并发消息下记录的时间戳只增不减。
    async fn is_stale(&self, message: &InvalidationMessage) -> bool {
        let Some(applied) = &self.applied else {
            return false;
        };
        let timestamp = message.timestamp();
        let result = applied
            .entry_by_ref(message.cache_key())
            .and_compute_with(|current| {
                let op = match current {
                    Some(last) if *last.value() >= timestamp => Op::Nop,
                    _ => Op::Put(timestamp),
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Unchanged(last) if *last.value() > timestamp)
    }
}

#[async_trait]
impl BackplaneListener for InvalidationSubscriber {
    async fn on_message(&self, message: InvalidationMessage) {
        if message.action() == Action::Sentinel {
            trace!(cache = %self.cache_name, source = %message.source_id(), "sentinel received");
            return;
        }

        if self.is_stale(&message).await {
            GLOBAL_METRICS.incr(&self.cache_name, "invalidation", "stale");
            debug!(
                cache = %self.cache_name,
                key = %redact_cache_key(message.cache_key()),
                timestamp = message.timestamp(),
                "dropping stale invalidation"
            );
            return;
        }

        match self.handler.apply(&message).await {
            Ok(()) => GLOBAL_METRICS.incr(&self.cache_name, "invalidation", "applied"),
            Err(e) => {
                GLOBAL_METRICS.incr(&self.cache_name, "invalidation", "apply_error");
                warn!(
                    cache = %self.cache_name,
                    key = %redact_cache_key(message.cache_key()),
                    error = %e,
                    "invalidation handler failed"
                );
            }
        }
    }

    async fn on_connect(&self, is_reconnection: bool) {
        if !is_reconnection {
            info!(cache = %self.cache_name, "backplane connected");
            return;
        }

        info!(cache = %self.cache_name, "backplane reconnected, resyncing");
        if self.controller.is_open(Subsystem::Backplane) {
            self.controller.probe_now(Subsystem::Backplane).await;
        } else {
            self.controller.drain(Subsystem::Backplane).await;
        }
        self.handler.on_resync().await;
    }
}
