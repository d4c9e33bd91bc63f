//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 基于Redis的分布式锁实现。
//!
//! 获取使用 `SET name owner NX PX abandon_timeout`，锁在放弃超时后自动过期，
//! 无需持有者心跳。释放使用比较后删除的 Lua 脚本，只删除自己持有的锁。

use super::{deadline_after, lock_name, time_left, DistributedLockToken, DistributedLocker};
use crate::backend::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::config::{DistributedLockConfig, RedisConfig};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// 连接状态，在锁实例与后台重连任务之间共享
#[derive(Default)]
struct ConnectionState {
    connection: RwLock<Option<ConnectionManager>>,
    reconnecting: AtomicBool,
}

/// Redis分布式锁
pub struct RedisLocker {
    cache_name: String,
    redis: RedisConfig,
    provider: Arc<dyn RedisProvider>,
    abandon_timeout: Duration,
    retry_interval: Duration,
    reconnect_interval: Duration,
    state: Arc<ConnectionState>,
    connect_lock: Mutex<()>,
    next_lease: AtomicU64,
    shutdown: CancellationToken,
}

impl RedisLocker {
    /// 创建新的Redis分布式锁
    ///
    /// 不会立即连接，首次获取锁时才建立连接。
    pub fn new(cache_name: impl Into<String>, config: &DistributedLockConfig) -> Result<Self> {
        Self::with_provider(cache_name, config, Arc::new(DefaultRedisProvider))
    }

    /// 使用指定的连接提供者创建
    pub fn with_provider(
        cache_name: impl Into<String>,
        config: &DistributedLockConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let redis = config.redis.clone().ok_or_else(|| {
            CacheError::ConfigError("redis lock requires a redis connection config".to_string())
        })?;
        Ok(Self {
            cache_name: cache_name.into(),
            redis,
            provider,
            abandon_timeout: config.abandon_timeout(),
            retry_interval: config.retry_interval(),
            reconnect_interval: config.reconnect_interval(),
            state: Arc::new(ConnectionState::default()),
            connect_lock: Mutex::new(()),
            next_lease: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// 是否已建立连接
    pub async fn is_connected(&self) -> bool {
        self.state.connection.read().await.is_some()
    }

    /// 后台重连是否在运行
    pub fn is_reconnecting(&self) -> bool {
        self.state.reconnecting.load(Ordering::Acquire)
    }

    /// 获取连接；首次调用时建立，失败则启动后台重连并返回 None
    async fn connection(&self) -> Option<ConnectionManager> {
        if let Some(conn) = self.state.connection.read().await.as_ref() {
            return Some(conn.clone());
        }
        if self.is_reconnecting() {
            return None;
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(conn) = self.state.connection.read().await.as_ref() {
            return Some(conn.clone());
        }
        if self.is_reconnecting() {
            return None;
        }

        match self.provider.connection_manager(&self.redis).await {
            Ok(manager) => {
                info!(cache = %self.cache_name, "distributed lock connected");
                *self.state.connection.write().await = Some(manager.clone());
                Some(manager)
            }
            Err(e) => {
                warn!(
                    cache = %self.cache_name,
                    error = %e,
                    "distributed lock connection failed, retrying in background"
                );
                self.spawn_reconnect();
                None
            }
        }
    }

    fn spawn_reconnect(&self) {
        if self.state.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let state = self.state.clone();
        let provider = self.provider.clone();
        let redis = self.redis.clone();
        let interval = self.reconnect_interval;
        let shutdown = self.shutdown.clone();
        let cache_name = self.cache_name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match provider.connection_manager(&redis).await {
                    Ok(manager) => {
                        *state.connection.write().await = Some(manager);
                        info!(cache = %cache_name, "distributed lock reconnected");
                        break;
                    }
                    Err(e) => {
                        debug!(cache = %cache_name, error = %e, "distributed lock reconnect attempt failed");
                    }
                }
            }
            state.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn try_set(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        owner: &str,
    ) -> Result<bool> {
        let abandon_ms = self.abandon_timeout.as_millis() as u64;
        let attempt = async {
            let reply: redis::RedisResult<Option<String>> = redis::cmd("SET")
                .arg(name)
                .arg(owner)
                .arg("NX")
                .arg("PX")
                .arg(abandon_ms)
                .query_async(conn)
                .await;
            reply
        };
        match tokio::time::timeout(self.redis.command_timeout(), attempt).await {
            Ok(reply) => Ok(reply?.is_some()),
            Err(_) => Err(CacheError::Timeout(format!(
                "SET NX timed out after {}ms",
                self.redis.command_timeout_ms
            ))),
        }
    }
}

#[async_trait]
impl DistributedLocker for RedisLocker {
    fn kind(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, cancel), level = "debug", fields(cache = %self.cache_name))]
    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<DistributedLockToken> {
        let mut conn = match self.connection().await {
            Some(conn) => conn,
            None => {
                GLOBAL_METRICS.incr(&self.cache_name, "redis_lock", "unavailable");
                return None;
            }
        };

        let name = lock_name(&self.cache_name, key);
        let owner = uuid::Uuid::new_v4().simple().to_string();
        let deadline = deadline_after(timeout);

        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                res = self.try_set(&mut conn, &name, &owner) => res,
            };

            match res {
                Ok(true) => {
                    GLOBAL_METRICS.incr(&self.cache_name, "redis_lock", "acquired");
                    let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
                    return Some(DistributedLockToken::new(name, owner, lease));
                }
                Ok(false) => {}
                Err(e) => {
                    GLOBAL_METRICS.incr(&self.cache_name, "redis_lock", "error");
                    warn!(
                        cache = %self.cache_name,
                        lock = %name,
                        error = %e,
                        "distributed lock unavailable, caller proceeds unsynchronized"
                    );
                    return None;
                }
            }

            let Some(left) = time_left(deadline, Instant::now()) else {
                GLOBAL_METRICS.incr(&self.cache_name, "redis_lock", "timeout");
                return None;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval.min(left)) => {}
            }
        }
    }

    async fn release(&self, token: DistributedLockToken) {
        let Some(mut conn) = self.state.connection.read().await.clone() else {
            debug!(cache = %self.cache_name, lock = %token.name(), "no connection, lock will expire");
            return;
        };

        let script = redis::Script::new(RELEASE_SCRIPT);
        let call = async {
            let deleted: redis::RedisResult<i32> = script
                .key(token.name())
                .arg(token.owner())
                .invoke_async(&mut conn)
                .await;
            deleted
        };

        match tokio::time::timeout(self.redis.command_timeout(), call).await {
            Ok(Ok(1)) => {
                GLOBAL_METRICS.incr(&self.cache_name, "redis_lock", "released");
                debug!(cache = %self.cache_name, lock = %token.name(), "lock released");
            }
            Ok(Ok(_)) => {
                debug!(
                    cache = %self.cache_name,
                    lock = %token.name(),
                    "lock already expired or owned by another node"
                );
            }
            Ok(Err(e)) => {
                warn!(cache = %self.cache_name, lock = %token.name(), error = %e, "lock release failed");
            }
            Err(_) => {
                warn!(cache = %self.cache_name, lock = %token.name(), "lock release timed out");
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RedisLocker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
