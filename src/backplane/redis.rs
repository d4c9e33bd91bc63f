//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 基于Redis Pub/Sub的背板实现。
//!
//! 订阅在后台任务中运行，连接断开后以指数退避重连（1秒起，翻倍，直到配置的
//! 上限），每次订阅成功都会通知监听者。异步发布通过 `ConnectionManager`，
//! 阻塞发布使用独立的同步连接，不依赖运行时。

use super::{Backplane, BackplaneListener, BackplaneOptions, Dispatcher};
use crate::backend::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::config::{BackplaneConfig, RedisConfig};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::protocol::{self, InvalidationMessage};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Redis背板
pub struct RedisBackplane {
    options: BackplaneOptions,
    channel: String,
    redis: RedisConfig,
    max_backoff: Duration,
    provider: Arc<dyn RedisProvider>,
    publisher: tokio::sync::Mutex<Option<ConnectionManager>>,
    blocking_conn: Mutex<Option<redis::Connection>>,
    subscription: Mutex<Option<Subscription>>,
}

impl RedisBackplane {
    /// 创建Redis背板，连接在首次使用时建立
    pub fn new(options: BackplaneOptions, config: &BackplaneConfig) -> Result<Self> {
        Self::with_provider(options, config, Arc::new(DefaultRedisProvider))
    }

    pub fn with_provider(
        options: BackplaneOptions,
        config: &BackplaneConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let redis = config.redis.clone().ok_or_else(|| {
            CacheError::ConfigError("redis backplane requires a redis connection config".to_string())
        })?;
        let channel = options.channel();
        Ok(Self {
            options,
            channel,
            redis,
            max_backoff: Duration::from_millis(config.max_reconnect_backoff_ms).max(INITIAL_BACKOFF),
            provider,
            publisher: tokio::sync::Mutex::new(None),
            blocking_conn: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 订阅任务是否在运行
    pub fn is_subscribed(&self) -> bool {
        self.lock_subscription()
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.provider.connection_manager(&self.redis).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn with_timeout_error(&self, op: &str) -> CacheError {
        CacheError::Timeout(format!(
            "{} timed out after {}ms",
            op, self.redis.command_timeout_ms
        ))
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut conn = self.publisher().await?;
        let call = async {
            let receivers: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(payload)
                .query_async(&mut conn)
                .await;
            receivers
        };
        match tokio::time::timeout(self.redis.command_timeout(), call).await {
            Ok(receivers) => {
                let receivers = receivers?;
                debug!(cache = %self.options.cache_name, receivers, "backplane published");
                Ok(())
            }
            Err(_) => Err(self.with_timeout_error("PUBLISH")),
        }
    }

    fn blocking_connection(&self) -> Result<redis::Connection> {
        let client = self.provider.client(&self.redis)?;
        let conn = client.get_connection_with_timeout(self.redis.connection_timeout())?;
        conn.set_read_timeout(Some(self.redis.command_timeout()))?;
        conn.set_write_timeout(Some(self.redis.command_timeout()))?;
        Ok(conn)
    }
}

/// 单次订阅会话：连接、订阅、转发消息直到连接断开
///
/// `connected_once` 在首次订阅成功后置位，此后的订阅成功才算重连。
async fn run_session(
    client: &redis::Client,
    redis: &RedisConfig,
    channel: &str,
    dispatcher: &Dispatcher,
    connected_once: &mut bool,
    backoff: &mut Duration,
) -> Result<()> {
    let mut pubsub = match tokio::time::timeout(redis.connection_timeout(), client.get_async_pubsub())
        .await
    {
        Ok(pubsub) => pubsub?,
        Err(_) => {
            return Err(CacheError::Timeout(format!(
                "pubsub connection timed out after {}ms",
                redis.connection_timeout_ms
            )))
        }
    };
    pubsub.subscribe(channel).await?;
    *backoff = INITIAL_BACKOFF;
    let is_reconnection = *connected_once;
    info!(channel = %channel, is_reconnection, "backplane subscribed");
    dispatcher.connected(is_reconnection);
    *connected_once = true;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        dispatcher.dispatch(msg.get_payload_bytes());
    }
    Ok(())
}

#[async_trait]
impl Backplane for RedisBackplane {
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn options(&self) -> &BackplaneOptions {
        &self.options
    }

    async fn subscribe(&self, listener: Arc<dyn BackplaneListener>) -> Result<()> {
        self.options.validate()?;
        let client = self.provider.client(&self.redis)?;
        let dispatcher = Dispatcher::new(&self.options, listener);

        let mut subscription = self.lock_subscription();
        if subscription.is_some() {
            return Err(CacheError::Misuse(format!(
                "backplane for cache '{}' is already subscribed",
                self.options.cache_name
            )));
        }

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let channel = self.channel.clone();
        let redis = self.redis.clone();
        let max_backoff = self.max_backoff;
        let cache_name = self.options.cache_name.clone();

        let task = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            let mut connected_once = false;
            loop {
                let session = run_session(
                    &client,
                    &redis,
                    &channel,
                    &dispatcher,
                    &mut connected_once,
                    &mut backoff,
                );
                let result = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    result = session => result,
                };
                match result {
                    Ok(()) => warn!(cache = %cache_name, "backplane connection closed, reconnecting"),
                    Err(e) => {
                        GLOBAL_METRICS.incr(&cache_name, "backplane", "subscribe_error");
                        warn!(
                            cache = %cache_name,
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "backplane subscription failed, retrying"
                        );
                    }
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
            debug!(cache = %cache_name, "backplane subscription stopped");
        });

        *subscription = Some(Subscription { cancel, task });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let subscription = self.lock_subscription().take();
        if let Some(subscription) = subscription {
            subscription.cancel.cancel();
            if let Err(e) = subscription.task.await {
                if !e.is_cancelled() {
                    return Err(CacheError::ShutdownError(e.to_string()));
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, message, cancel), level = "debug", fields(cache = %self.options.cache_name))]
    async fn publish(
        &self,
        message: &InvalidationMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = protocol::encode(message);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            result = self.send(&payload) => result,
        };
        GLOBAL_METRICS.incr(
            &self.options.cache_name,
            "backplane",
            if result.is_ok() { "publish" } else { "publish_error" },
        );
        result
    }

    fn publish_blocking(&self, message: &InvalidationMessage) -> Result<()> {
        let payload = protocol::encode(message);
        let mut guard = self
            .blocking_conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(self.blocking_connection()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::Backplane("no blocking connection".to_string()));
        };

        let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query(conn);
        match result {
            Ok(_) => {
                GLOBAL_METRICS.incr(&self.options.cache_name, "backplane", "publish");
                Ok(())
            }
            Err(e) => {
                // 连接状态未知，下次重新建立
                *guard = None;
                GLOBAL_METRICS.incr(&self.options.cache_name, "backplane", "publish_error");
                Err(e.into())
            }
        }
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let probe = async {
            let mut conn = self.publisher().await?;
            let call = async {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                pong
            };
            match tokio::time::timeout(self.redis.command_timeout(), call).await {
                Ok(pong) => pong.map(|_| ()).map_err(CacheError::from),
                Err(_) => Err(self.with_timeout_error("PING")),
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = probe => result,
        }
    }
}

impl Drop for RedisBackplane {
    fn drop(&mut self) {
        if let Some(subscription) = self.lock_subscription().take() {
            subscription.cancel.cancel();
        }
    }
}
