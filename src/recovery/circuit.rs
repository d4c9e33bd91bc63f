//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了受保护子系统的熔断器。

use crate::config::ResilienceConfig;
use crate::metrics::GLOBAL_METRICS;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// 受保护的子系统
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// 分布式缓存层
    DistributedCache,
    /// 背板
    Backplane,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::DistributedCache, Subsystem::Backplane];

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::DistributedCache => "distributed_cache",
            Subsystem::Backplane => "backplane",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 熔断中，调用被跳过
    Open { since: Instant },
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// 最近的调用结果，true 表示失败
    window: VecDeque<bool>,
}

/// 熔断器
///
/// 连续失败次数达到阈值，或滑动窗口内失败率达到阈值时打开。打开后只能由
/// 探测成功关闭。
#[derive(Debug)]
pub struct CircuitBreaker {
    cache_name: String,
    subsystem: Subsystem,
    failure_threshold: u32,
    failure_ratio: Option<f64>,
    window_size: usize,
    min_calls: usize,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cache_name: impl Into<String>, subsystem: Subsystem, config: &ResilienceConfig) -> Self {
        Self {
            cache_name: cache_name.into(),
            subsystem,
            failure_threshold: config.failure_threshold.max(1),
            failure_ratio: config.failure_ratio,
            window_size: config.window_size.max(1),
            min_calls: config.min_calls,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                window: VecDeque::with_capacity(config.window_size.max(1)),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() == self.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn ratio_tripped(&self, inner: &BreakerInner) -> bool {
        let Some(threshold) = self.failure_ratio else {
            return false;
        };
        let calls = inner.window.len();
        if calls == 0 || calls < self.min_calls {
            return false;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        failures as f64 / calls as f64 >= threshold
    }

    /// 记录一次成功调用
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        self.push_outcome(&mut inner, false);
    }

    /// 记录一次失败调用，返回本次是否导致熔断打开
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        self.push_outcome(&mut inner, true);

        if inner.state.is_open() {
            return false;
        }
        let by_count = inner.consecutive_failures >= self.failure_threshold;
        if !by_count && !self.ratio_tripped(&inner) {
            return false;
        }

        inner.state = CircuitState::Open {
            since: Instant::now(),
        };
        let consecutive = inner.consecutive_failures;
        drop(inner);

        GLOBAL_METRICS.incr(&self.cache_name, self.subsystem.as_str(), "circuit_opened");
        GLOBAL_METRICS.set_circuit_open(&self.cache_name, self.subsystem.as_str(), true);
        warn!(
            cache = %self.cache_name,
            subsystem = %self.subsystem,
            consecutive_failures = consecutive,
            by_ratio = !by_count,
            "circuit opened"
        );
        true
    }

    /// 探测成功后关闭熔断器，返回是否发生了状态转换
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.window.clear();
        let since = match inner.state {
            CircuitState::Open { since } => since,
            CircuitState::Closed => return false,
        };
        inner.state = CircuitState::Closed;
        drop(inner);

        GLOBAL_METRICS.incr(&self.cache_name, self.subsystem.as_str(), "circuit_closed");
        GLOBAL_METRICS.set_circuit_open(&self.cache_name, self.subsystem.as_str(), false);
        info!(
            cache = %self.cache_name,
            subsystem = %self.subsystem,
            open_for_ms = since.elapsed().as_millis() as u64,
            "circuit closed"
        );
        true
    }
}
