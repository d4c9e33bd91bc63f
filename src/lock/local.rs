//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 进程内按键互斥锁，用于缓存击穿（stampede）保护。
//!
//! 锁池由固定数量的单许可信号量组成，按键的 murmur3 哈希分段。
//! 不相关的键只会因分段碰撞而互相等待，内存占用与键数量无关。

use super::{deadline_after, time_left};
use crate::metrics::GLOBAL_METRICS;
use crate::utils::redaction::redact_cache_key;
use murmur3::murmur3_32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

const HASH_SEED: u32 = 0x9747_b28c;
const MAX_BLOCKING_BACKOFF: Duration = Duration::from_millis(1);

/// 本地锁令牌
///
/// 持有期间对应分段被占用；显式释放或 drop 时归还。
#[derive(Debug)]
pub struct LocalLockToken {
    key: String,
    stripe: usize,
    id: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl LocalLockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn stripe(&self) -> usize {
        self.stripe
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 令牌是否仍持有锁
    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }

    /// 释放锁，重复调用无副作用
    ///
    /// 返回本次调用是否真正释放了锁
    pub fn release(&mut self) -> bool {
        match self.permit.take() {
            Some(permit) => {
                drop(permit);
                true
            }
            None => false,
        }
    }
}

/// 分段本地锁
pub struct StripedLocker {
    cache_name: String,
    stripes: Box<[Arc<Semaphore>]>,
    mask: usize,
    next_id: AtomicU64,
}

impl std::fmt::Debug for StripedLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLocker")
            .field("cache_name", &self.cache_name)
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

impl StripedLocker {
    /// 创建新的分段锁
    ///
    /// # 参数
    ///
    /// * `cache_name` - 所属缓存名称，用于日志和指标
    /// * `stripes` - 分段数量，向上取整为2的幂，至少为1
    pub fn new(cache_name: impl Into<String>, stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let stripes = (0..count)
            .map(|_| Arc::new(Semaphore::new(1)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cache_name: cache_name.into(),
            stripes,
            mask: count - 1,
            next_id: AtomicU64::new(1),
        }
    }

    /// 分段数量
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// 计算键所属的分段
    pub fn stripe_of(&self, key: &str) -> usize {
        let mut bytes = key.as_bytes();
        let hash = murmur3_32(&mut bytes, HASH_SEED).unwrap_or(0);
        hash as usize & self.mask
    }

    fn token(&self, key: &str, stripe: usize, permit: OwnedSemaphorePermit) -> LocalLockToken {
        GLOBAL_METRICS.incr(&self.cache_name, "local_lock", "acquired");
        LocalLockToken {
            key: key.to_string(),
            stripe,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            permit: Some(permit),
        }
    }

    fn timed_out(&self, key: &str) -> Option<LocalLockToken> {
        GLOBAL_METRICS.incr(&self.cache_name, "local_lock", "timeout");
        debug!(
            cache = %self.cache_name,
            key = %redact_cache_key(key),
            "local lock not acquired within timeout, caller proceeds unsynchronized"
        );
        None
    }

    /// 获取键锁（异步）
    ///
    /// 超时或被取消时返回 `None`，调用方应直接执行受保护操作。
    #[instrument(
        skip(self, key, cancel),
        level = "debug",
        fields(cache = %self.cache_name, key = %redact_cache_key(key))
    )]
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<LocalLockToken> {
        let stripe = self.stripe_of(key);
        let semaphore = self.stripes[stripe].clone();

        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Some(self.token(key, stripe, permit));
        }
        if timeout.is_zero() {
            return self.timed_out(key);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                GLOBAL_METRICS.incr(&self.cache_name, "local_lock", "cancelled");
                debug!(cache = %self.cache_name, "local lock acquisition cancelled");
                None
            }
            res = tokio::time::timeout(timeout, semaphore.acquire_owned()) => match res {
                Ok(Ok(permit)) => Some(self.token(key, stripe, permit)),
                // 信号量从不关闭，这里仅防御性地视为未获取
                Ok(Err(_)) => None,
                Err(_) => self.timed_out(key),
            }
        }
    }

    /// 获取键锁（阻塞）
    ///
    /// 以短退避轮询的方式等待，不依赖运行时，适合在同步路径中调用。
    pub fn acquire_blocking(&self, key: &str, timeout: Duration) -> Option<LocalLockToken> {
        let stripe = self.stripe_of(key);
        let semaphore = &self.stripes[stripe];
        let deadline = deadline_after(timeout);
        let mut backoff = Duration::from_micros(20);

        loop {
            if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                return Some(self.token(key, stripe, permit));
            }
            let Some(left) = time_left(deadline, Instant::now()) else {
                return self.timed_out(key);
            };
            std::thread::sleep(backoff.min(left));
            backoff = (backoff * 2).min(MAX_BLOCKING_BACKOFF);
        }
    }

    /// 释放锁
    ///
    /// 幂等，从不向调用方传播错误。
    pub fn release(&self, mut token: LocalLockToken) {
        if token.release() {
            trace!(cache = %self.cache_name, stripe = token.stripe, "local lock released");
        } else {
            debug!(
                cache = %self.cache_name,
                token = token.id,
                "release called on a token that no longer holds the lock"
            );
        }
    }

    /// 当前被占用的分段数
    pub fn held_stripes(&self) -> usize {
        self.stripes
            .iter()
            .filter(|s| s.available_permits() == 0)
            .count()
    }
}
