//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了按键互斥锁：进程内分段锁和跨进程分布式锁。
//!
//! 锁只是延迟和吞吐的优化手段：获取失败（超时、服务不可用、被取消）时返回
//! `None`，调用方照常执行受保护操作。

pub mod blocking;
pub mod local;
pub mod memory;
pub mod redis;

pub use blocking::BlockingLocker;
pub use local::{LocalLockToken, StripedLocker};
pub use memory::MemoryLocker;
pub use self::redis::RedisLocker;

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 超时对应的截止时间，溢出时返回 None，表示一直等待
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// 距截止时间的剩余时长，已到期时返回 None
pub(crate) fn time_left(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    match deadline {
        Some(deadline) => deadline
            .checked_duration_since(now)
            .filter(|left| !left.is_zero()),
        None => Some(Duration::MAX),
    }
}

/// 构造分布式锁名称
pub fn lock_name(cache_name: &str, key: &str) -> String {
    format!("{}.Lock.{}", cache_name, key)
}

/// 分布式锁令牌
///
/// 分布式令牌不会在 drop 时释放：未释放的锁在放弃超时后由其他节点回收。
#[derive(Debug)]
pub struct DistributedLockToken {
    name: String,
    owner: String,
    lease_id: u64,
    acquired_at: Instant,
}

impl DistributedLockToken {
    pub(crate) fn new(name: String, owner: String, lease_id: u64) -> Self {
        Self {
            name,
            owner,
            lease_id,
            acquired_at: Instant::now(),
        }
    }

    /// 锁名称（已带缓存名前缀）
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 持有者标识，写入锁服务的值
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    /// 已持有时长
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// 分布式按键锁
///
/// 所有实现遵循相同契约：获取失败返回 `None`，释放从不向调用方报错。
#[async_trait]
pub trait DistributedLocker: Send + Sync {
    /// 实现名称，用于日志
    fn kind(&self) -> &'static str;

    /// 获取键锁
    ///
    /// # 参数
    ///
    /// * `key` - 缓存键，实现负责加上缓存名前缀
    /// * `timeout` - 最长等待时间
    /// * `cancel` - 取消信号，触发后返回 `None`
    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<DistributedLockToken>;

    /// 释放锁
    ///
    /// 对已过期或已被他人回收的令牌是无操作。
    async fn release(&self, token: DistributedLockToken);

    /// 停止后台任务
    async fn shutdown(&self) {}
}

/// 禁用分布式锁时使用的空实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLocker;

#[async_trait]
impl DistributedLocker for NullLocker {
    fn kind(&self) -> &'static str {
        "none"
    }

    async fn acquire(
        &self,
        _key: &str,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Option<DistributedLockToken> {
        None
    }

    async fn release(&self, _token: DistributedLockToken) {}
}
