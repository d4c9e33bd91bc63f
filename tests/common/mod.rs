//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

use async_trait::async_trait;
use oxcache_backplane::error::Result;
use oxcache_backplane::sync::InvalidationHandler;
use oxcache_backplane::{BackplaneListener, InvalidationMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

pub use oxcache_backplane::utils::{generate_unique_name, setup_logging};

/// 检查Redis是否可用，不可用时测试应直接跳过
#[allow(dead_code)]
pub async fn redis_url_if_available() -> Option<String> {
    if !oxcache_backplane::utils::is_redis_available() {
        return None;
    }
    let url = oxcache_backplane::utils::redis_test_url();
    if oxcache_backplane::utils::wait_for_redis(&url, Duration::from_secs(2)).await {
        Some(url)
    } else {
        None
    }
}

/// 记录收到的失效消息
#[derive(Default)]
pub struct RecordingHandler {
    applied: Mutex<Vec<InvalidationMessage>>,
    resyncs: AtomicUsize,
    notify: Notify,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn applied(&self) -> Vec<InvalidationMessage> {
        self.applied.lock().unwrap().clone()
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }

    /// 等待至少收到 `count` 条消息
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.applied.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.applied.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl InvalidationHandler for RecordingHandler {
    async fn apply(&self, message: &InvalidationMessage) -> Result<()> {
        self.applied.lock().unwrap().push(message.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn on_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
    }
}

/// 直接挂在背板上的监听者，记录原始消息和连接事件
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<InvalidationMessage>>,
    connects: Mutex<Vec<bool>>,
    notify: Notify,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl RecordingListener {
    /// 每条消息处理前先等待 `delay`，模拟慢订阅者
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<InvalidationMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<bool> {
        self.connects.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.messages.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.messages.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl BackplaneListener for RecordingListener {
    async fn on_message(&self, message: InvalidationMessage) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.messages.lock().unwrap().push(message);
        self.notify.notify_waiters();
    }

    async fn on_connect(&self, is_reconnection: bool) {
        self.connects.lock().unwrap().push(is_reconnection);
        self.notify.notify_waiters();
    }
}
