//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了节点级的消息时间戳来源。

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 单调不减的毫秒时间戳来源
///
/// 以 Unix 毫秒为基准；系统时钟回拨时沿用上一次的值，保证同一节点发出的
/// 时间戳不会倒退，且始终大于 0。
#[derive(Debug, Default)]
pub struct TimestampSource {
    last: AtomicI64,
}

impl TimestampSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_clock_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// 取下一个时间戳
    pub fn now(&self) -> i64 {
        let wall = Self::wall_clock_millis().max(1);
        let previous = self
            .last
            .fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }

    /// 最近一次发出的时间戳
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}
