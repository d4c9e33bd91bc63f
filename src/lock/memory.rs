//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 无外部连接的分布式锁实现，契约与 Redis 实现一致，用于本地集成测试。
//!
//! 锁槽保存在 moka 缓存中，按滑动过期（time-to-idle）淘汰；
//! 被淘汰的锁槽会关闭其信号量，等待者随即放弃并重新取槽。

use super::{deadline_after, lock_name, time_left, DistributedLockToken, DistributedLocker};
use crate::config::DistributedLockConfig;
use crate::metrics::GLOBAL_METRICS;
use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    /// None 表示放弃超时过大，租约不会被回收
    expires_at: Option<Instant>,
}

/// 单个锁名对应的锁槽
#[derive(Debug)]
pub struct LockSlot {
    semaphore: Semaphore,
    lease: Mutex<Option<Lease>>,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
            lease: Mutex::new(None),
        }
    }

    fn lease(&self) -> std::sync::MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn grant(&self, id: u64, abandon_timeout: Duration) {
        *self.lease() = Some(Lease {
            id,
            expires_at: deadline_after(abandon_timeout),
        });
    }

    /// 回收超过放弃超时的租约，返回是否发生回收
    fn reclaim_if_abandoned(&self, now: Instant) -> bool {
        let mut lease = self.lease();
        match *lease {
            Some(l) if l.expires_at.is_some_and(|at| at <= now) => {
                *lease = None;
                self.semaphore.add_permits(1);
                true
            }
            _ => false,
        }
    }

    /// 当前租约剩余时间
    fn lease_remaining(&self, now: Instant) -> Option<Duration> {
        self.lease()
            .map(|l| match l.expires_at {
                Some(at) => at.saturating_duration_since(now),
                None => Duration::MAX,
            })
    }

    /// 仅当租约属于该令牌时释放
    fn release(&self, id: u64) -> bool {
        let mut lease = self.lease();
        match *lease {
            Some(l) if l.id == id => {
                *lease = None;
                self.semaphore.add_permits(1);
                true
            }
            _ => false,
        }
    }

    fn is_leased(&self) -> bool {
        self.lease().is_some()
    }
}

/// 锁槽淘汰时传给淘汰回调的上下文
#[derive(Debug, Clone)]
pub struct SlotEvictionContext {
    cache_name: String,
}

impl SlotEvictionContext {
    /// 处理淘汰：关闭信号量，让所有等待者退出
    pub fn on_evicted(&self, name: &str, slot: &LockSlot, cause: RemovalCause) {
        slot.semaphore.close();
        GLOBAL_METRICS.incr(&self.cache_name, "memory_lock", "slot_evicted");
        if slot.is_leased() {
            warn!(
                cache = %self.cache_name,
                lock = %name,
                ?cause,
                "lock slot evicted while a lease was still recorded"
            );
        } else {
            debug!(cache = %self.cache_name, lock = %name, ?cause, "idle lock slot disposed");
        }
    }
}

/// 进程内分布式锁
pub struct MemoryLocker {
    cache_name: String,
    slots: Cache<String, Arc<LockSlot>>,
    abandon_timeout: Duration,
    retry_interval: Duration,
    next_lease: AtomicU64,
}

impl MemoryLocker {
    /// 创建新的进程内分布式锁
    pub fn new(cache_name: impl Into<String>, config: &DistributedLockConfig) -> Self {
        let cache_name = cache_name.into();
        let context = SlotEvictionContext {
            cache_name: cache_name.clone(),
        };
        let slots = Cache::builder()
            .time_to_idle(config.idle_eviction())
            .eviction_listener(move |name: Arc<String>, slot: Arc<LockSlot>, cause| {
                context.on_evicted(&name, &slot, cause)
            })
            .build();

        Self {
            cache_name,
            slots,
            abandon_timeout: config.abandon_timeout(),
            retry_interval: config.retry_interval(),
            next_lease: AtomicU64::new(1),
        }
    }

    async fn slot(&self, name: &str) -> Arc<LockSlot> {
        self.slots
            .get_with(name.to_string(), async { Arc::new(LockSlot::new()) })
            .await
    }

    fn grant(&self, name: String, slot: &LockSlot) -> DistributedLockToken {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        slot.grant(id, self.abandon_timeout);
        GLOBAL_METRICS.incr(&self.cache_name, "memory_lock", "acquired");
        DistributedLockToken::new(name, format!("memory-{}", id), id)
    }

    /// 当前锁槽数量（含尚未执行的淘汰）
    pub fn slot_count(&self) -> u64 {
        self.slots.entry_count()
    }

    /// 执行挂起的淘汰任务
    pub async fn run_pending_tasks(&self) {
        self.slots.run_pending_tasks().await;
    }
}

#[async_trait]
impl DistributedLocker for MemoryLocker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, cancel), level = "debug", fields(cache = %self.cache_name))]
    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<DistributedLockToken> {
        let name = lock_name(&self.cache_name, key);
        let deadline = deadline_after(timeout);

        loop {
            let slot = self.slot(&name).await;
            let now = Instant::now();
            if slot.reclaim_if_abandoned(now) {
                GLOBAL_METRICS.incr(&self.cache_name, "memory_lock", "abandoned_reclaimed");
                warn!(cache = %self.cache_name, lock = %name, "reclaimed abandoned lock");
            }

            if let Ok(permit) = slot.semaphore.try_acquire() {
                permit.forget();
                return Some(self.grant(name, &slot));
            }

            let Some(left) = time_left(deadline, now) else {
                GLOBAL_METRICS.incr(&self.cache_name, "memory_lock", "timeout");
                return None;
            };

            let mut wait = left.min(self.retry_interval);
            if let Some(remaining) = slot.lease_remaining(now) {
                wait = wait.min(remaining.max(Duration::from_millis(1)));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(cache = %self.cache_name, lock = %name, "lock acquisition cancelled");
                    return None;
                }
                res = tokio::time::timeout(wait, slot.semaphore.acquire()) => match res {
                    Ok(Ok(permit)) => {
                        permit.forget();
                        return Some(self.grant(name, &slot));
                    }
                    // 锁槽已被淘汰，下一轮重新取槽
                    Ok(Err(_)) => continue,
                    Err(_) => continue,
                }
            }
        }
    }

    async fn release(&self, token: DistributedLockToken) {
        match self.slots.get(token.name()).await {
            Some(slot) if slot.release(token.lease_id()) => {
                GLOBAL_METRICS.incr(&self.cache_name, "memory_lock", "released");
                debug!(cache = %self.cache_name, lock = %token.name(), "lock released");
            }
            _ => {
                debug!(
                    cache = %self.cache_name,
                    lock = %token.name(),
                    "release ignored: lease expired, reclaimed or slot evicted"
                );
            }
        }
    }

    async fn shutdown(&self) {
        self.slots.invalidate_all();
        self.slots.run_pending_tasks().await;
    }
}
