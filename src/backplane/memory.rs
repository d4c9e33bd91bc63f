//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 进程内背板实现。
//!
//! [`MemoryHub`] 由注册表显式创建并共享给同一进程内的所有节点。发布时对
//! 订阅者集合做快照，再逐个分发；订阅者的处理在各自的任务中执行，慢订阅者
//! 不会阻塞发布者或其他订阅者。

use super::{Backplane, BackplaneListener, BackplaneOptions, DispatchOutcome, Dispatcher};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::protocol::{self, InvalidationMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

type Subscribers = Arc<DashMap<u64, Dispatcher>>;

/// 进程内频道注册中心
#[derive(Default)]
pub struct MemoryHub {
    channels: DashMap<String, Subscribers>,
    next_id: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, channel: &str, dispatcher: Dispatcher) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // 持有分片写锁期间插入，避免与 unregister 的空频道清理交错
        let subscribers = self.channels.entry(channel.to_string()).or_default();
        subscribers.insert(id, dispatcher);
        id
    }

    fn unregister(&self, channel: &str, id: u64) {
        if let Some(subscribers) = self.channels.get(channel) {
            subscribers.remove(&id);
        }
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
    }

    fn snapshot(&self, channel: &str) -> Vec<Dispatcher> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// 频道上的订阅者数量
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// 当前活跃的频道数量
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 向频道投递一条负载，返回实际交给监听者的数量
    fn deliver(&self, channel: &str, payload: &[u8]) -> usize {
        self.snapshot(channel)
            .iter()
            .filter(|dispatcher| dispatcher.dispatch(payload) == DispatchOutcome::Delivered)
            .count()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// 进程内背板
pub struct MemoryBackplane {
    options: BackplaneOptions,
    channel: String,
    hub: Arc<MemoryHub>,
    subscription: Mutex<Option<u64>>,
}

impl MemoryBackplane {
    pub fn new(options: BackplaneOptions, hub: Arc<MemoryHub>) -> Self {
        let channel = options.channel();
        Self {
            options,
            channel,
            hub,
            subscription: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    fn subscription(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, message: &InvalidationMessage) -> Result<()> {
        let payload = protocol::encode(message);
        let delivered = self.hub.deliver(&self.channel, &payload);
        GLOBAL_METRICS.incr(&self.options.cache_name, "backplane", "publish");
        debug!(
            cache = %self.options.cache_name,
            channel = %self.channel,
            delivered,
            "memory backplane published"
        );
        Ok(())
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn options(&self) -> &BackplaneOptions {
        &self.options
    }

    async fn subscribe(&self, listener: Arc<dyn BackplaneListener>) -> Result<()> {
        self.options.validate()?;
        let dispatcher = Dispatcher::new(&self.options, listener);
        {
            let mut subscription = self.subscription();
            if subscription.is_some() {
                return Err(CacheError::Misuse(format!(
                    "backplane for cache '{}' is already subscribed",
                    self.options.cache_name
                )));
            }
            *subscription = Some(self.hub.register(&self.channel, dispatcher.clone()));
        }
        dispatcher.connected(false);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if let Some(id) = self.subscription().take() {
            self.hub.unregister(&self.channel, id);
        }
        Ok(())
    }

    #[instrument(skip(self, message, cancel), level = "debug", fields(cache = %self.options.cache_name))]
    async fn publish(
        &self,
        message: &InvalidationMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.send(message)
    }

    fn publish_blocking(&self, message: &InvalidationMessage) -> Result<()> {
        self.send(message)
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(())
    }
}

impl Drop for MemoryBackplane {
    fn drop(&mut self) {
        if let Some(id) = self.subscription().take() {
            self.hub.unregister(&self.channel, id);
        }
    }
}
