//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了弹性控制器：包装对受保护子系统的调用，维护熔断器和恢复队列，
//! 并在后台定期探测已熔断的子系统。

use super::circuit::{CircuitBreaker, CircuitState, Subsystem};
use super::queue::{RecoveryItem, RecoveryQueue};
use crate::config::ResilienceConfig;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 子系统的探测与重放入口
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// 一次真实的往返，成功表示子系统已恢复
    async fn probe(&self) -> Result<()>;

    /// 重放一条排队的变更
    async fn replay(&self, item: &RecoveryItem) -> Result<()>;
}

/// 受保护调用的结果
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// 调用成功
    Completed(T),
    /// 调用失败，已计入熔断器
    Failed(CacheError),
    /// 熔断中，调用未执行
    Skipped,
}

impl<T> CallOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, CallOutcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CallOutcome::Skipped)
    }

    /// 转为 `Result`，跳过的调用返回 [`CacheError::CircuitOpen`]
    pub fn into_result(self, subsystem: Subsystem) -> Result<T> {
        match self {
            CallOutcome::Completed(value) => Ok(value),
            CallOutcome::Failed(e) => Err(e),
            CallOutcome::Skipped => Err(CacheError::CircuitOpen(subsystem.to_string())),
        }
    }
}

/// 一次队列重放的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

struct Guard {
    breaker: CircuitBreaker,
    queue: RecoveryQueue,
    target: RwLock<Option<Weak<dyn RecoveryTarget>>>,
    draining: tokio::sync::Mutex<()>,
}

impl Guard {
    fn new(cache_name: &str, subsystem: Subsystem, config: &ResilienceConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(cache_name, subsystem, config),
            queue: RecoveryQueue::new(cache_name, subsystem.as_str(), config.queue_capacity),
            target: RwLock::new(None),
            draining: tokio::sync::Mutex::new(()),
        }
    }

    fn target(&self) -> Option<Arc<dyn RecoveryTarget>> {
        self.target
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

struct ControllerInner {
    cache_name: String,
    max_replay_attempts: u32,
    probe_interval: Duration,
    distributed_cache: Guard,
    backplane: Guard,
    shutdown: CancellationToken,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ControllerInner {
    fn guard(&self, subsystem: Subsystem) -> &Guard {
        match subsystem {
            Subsystem::DistributedCache => &self.distributed_cache,
            Subsystem::Backplane => &self.backplane,
        }
    }
}

/// 弹性控制器
///
/// 可廉价克隆，克隆体共享同一组熔断器和队列。
#[derive(Clone)]
pub struct ResilienceController {
    inner: Arc<ControllerInner>,
}

impl ResilienceController {
    pub fn new(cache_name: impl Into<String>, config: &ResilienceConfig) -> Self {
        let cache_name = cache_name.into();
        Self {
            inner: Arc::new(ControllerInner {
                distributed_cache: Guard::new(&cache_name, Subsystem::DistributedCache, config),
                backplane: Guard::new(&cache_name, Subsystem::Backplane, config),
                cache_name,
                max_replay_attempts: config.max_replay_attempts.max(1),
                probe_interval: config.probe_interval(),
                shutdown: CancellationToken::new(),
                prober: Mutex::new(None),
            }),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.inner.cache_name
    }

    /// 注册子系统的探测与重放入口
    ///
    /// 控制器只保存弱引用，入口由调用方持有。入口被释放后探测和重放都视为
    /// 未注册。
    pub fn register_target<T: RecoveryTarget + 'static>(
        &self,
        subsystem: Subsystem,
        target: &Arc<T>,
    ) {
        let target: Weak<T> = Arc::downgrade(target);
        let target: Weak<dyn RecoveryTarget> = target;
        *self
            .inner
            .guard(subsystem)
            .target
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(target);
    }

    pub fn state(&self, subsystem: Subsystem) -> CircuitState {
        self.inner.guard(subsystem).breaker.state()
    }

    pub fn is_open(&self, subsystem: Subsystem) -> bool {
        self.inner.guard(subsystem).breaker.is_open()
    }

    pub fn queue_len(&self, subsystem: Subsystem) -> usize {
        self.inner.guard(subsystem).queue.len()
    }

    /// 排队中的恢复项快照
    pub fn pending(&self, subsystem: Subsystem) -> Vec<RecoveryItem> {
        self.inner.guard(subsystem).queue.snapshot()
    }

    /// 直接将变更放入恢复队列
    pub fn enqueue(&self, subsystem: Subsystem, item: RecoveryItem) {
        self.inner.guard(subsystem).queue.enqueue(item);
    }

    /// 执行一次受保护的调用
    ///
    /// 熔断打开时 `op` 不会被调用，`item` 进入恢复队列。调用失败时计入熔断器
    /// 并同样将 `item` 入队。被取消的调用既不计为失败也不入队。
    pub async fn execute<T, F, Fut>(
        &self,
        subsystem: Subsystem,
        item: Option<RecoveryItem>,
        op: F,
    ) -> CallOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.admit(subsystem, item) {
            Ok(item) => self.settle(subsystem, item, op().await),
            Err(()) => CallOutcome::Skipped,
        }
    }

    /// [`execute`](Self::execute) 的阻塞版本
    pub fn execute_blocking<T, F>(
        &self,
        subsystem: Subsystem,
        item: Option<RecoveryItem>,
        op: F,
    ) -> CallOutcome<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.admit(subsystem, item) {
            Ok(item) => self.settle(subsystem, item, op()),
            Err(()) => CallOutcome::Skipped,
        }
    }

    /// 熔断打开时将 `item` 入队并拒绝调用
    fn admit(
        &self,
        subsystem: Subsystem,
        item: Option<RecoveryItem>,
    ) -> std::result::Result<Option<RecoveryItem>, ()> {
        let guard = self.inner.guard(subsystem);
        if !guard.breaker.is_open() {
            return Ok(item);
        }
        GLOBAL_METRICS.incr(&self.inner.cache_name, subsystem.as_str(), "skipped");
        debug!(cache = %self.inner.cache_name, %subsystem, "circuit open, call skipped");
        if let Some(item) = item {
            guard.queue.enqueue(item);
        }
        Err(())
    }

    fn settle<T>(
        &self,
        subsystem: Subsystem,
        item: Option<RecoveryItem>,
        result: Result<T>,
    ) -> CallOutcome<T> {
        let cache_name = &self.inner.cache_name;
        let guard = self.inner.guard(subsystem);
        match result {
            Ok(value) => {
                guard.breaker.record_success();
                CallOutcome::Completed(value)
            }
            Err(CacheError::Cancelled) => CallOutcome::Failed(CacheError::Cancelled),
            Err(e) => {
                GLOBAL_METRICS.incr(cache_name, subsystem.as_str(), "failure");
                warn!(cache = %cache_name, %subsystem, error = %e, "guarded call failed");
                guard.breaker.record_failure();
                if let Some(item) = item {
                    guard.queue.enqueue(item);
                }
                CallOutcome::Failed(e)
            }
        }
    }

    /// 立即探测一次子系统
    ///
    /// 成功时关闭熔断器并重放队列，返回探测是否成功。未注册入口时返回 false。
    pub async fn probe_now(&self, subsystem: Subsystem) -> bool {
        let cache_name = &self.inner.cache_name;
        let Some(target) = self.inner.guard(subsystem).target() else {
            return false;
        };

        match target.probe().await {
            Ok(()) => {
                GLOBAL_METRICS.incr(cache_name, subsystem.as_str(), "probe_success");
                self.inner.guard(subsystem).breaker.close();
                if self.queue_len(subsystem) > 0 {
                    self.drain(subsystem).await;
                }
                true
            }
            Err(e) => {
                GLOBAL_METRICS.incr(cache_name, subsystem.as_str(), "probe_failure");
                debug!(cache = %cache_name, %subsystem, error = %e, "probe failed, circuit stays open");
                false
            }
        }
    }

    /// 重放恢复队列
    ///
    /// 熔断打开时不重放。同一子系统的重放串行执行。
    pub async fn drain(&self, subsystem: Subsystem) -> DrainReport {
        let cache_name = &self.inner.cache_name;
        let guard = self.inner.guard(subsystem);
        let mut report = DrainReport::default();

        let Some(target) = guard.target() else {
            return report;
        };
        let _draining = guard.draining.lock().await;
        if guard.breaker.is_open() {
            return report;
        }

        let items = guard.queue.drain_latest_per_key();
        if items.is_empty() {
            return report;
        }

        let mut items = items.into_iter();
        while let Some(mut item) = items.next() {
            match target.replay(&item).await {
                Ok(()) => {
                    guard.breaker.record_success();
                    report.replayed += 1;
                }
                Err(e) => {
                    guard.breaker.record_failure();
                    item.attempts += 1;
                    if item.attempts >= self.inner.max_replay_attempts {
                        GLOBAL_METRICS.incr(cache_name, subsystem.as_str(), "recovery_dropped");
                        warn!(
                            cache = %cache_name,
                            %subsystem,
                            attempts = item.attempts,
                            error = %e,
                            "recovery item dropped after repeated replay failures"
                        );
                        report.dropped += 1;
                    } else {
                        guard.queue.enqueue(item);
                        report.requeued += 1;
                    }

                    if guard.breaker.is_open() {
                        // 剩余条目不再尝试，原样放回
                        for rest in items.by_ref() {
                            guard.queue.enqueue(rest);
                            report.requeued += 1;
                        }
                        break;
                    }
                }
            }
        }

        GLOBAL_METRICS.incr_by(
            cache_name,
            subsystem.as_str(),
            "recovery_replayed",
            report.replayed as u64,
        );
        info!(
            cache = %cache_name,
            %subsystem,
            replayed = report.replayed,
            requeued = report.requeued,
            dropped = report.dropped,
            "recovery queue drained"
        );
        report
    }

    /// 启动后台探测任务，重复调用无效果
    pub fn start_prober(&self) {
        let mut slot = self
            .inner
            .prober
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.probe_interval;
        let cache_name = self.inner.cache_name.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let controller = ResilienceController { inner };

                let round = async {
                    for subsystem in Subsystem::ALL {
                        if controller.is_open(subsystem) {
                            controller.probe_now(subsystem).await;
                        }
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = round => {}
                }
            }
            debug!(cache = %cache_name, "prober stopped");
        }));
    }

    /// 通知后台探测退出，不等待任务结束
    pub fn stop_prober(&self) {
        self.inner.shutdown.cancel();
    }

    /// 停止后台探测
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .prober
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(cache = %self.inner.cache_name, error = %e, "prober task failed");
                }
            }
        }
    }
}
