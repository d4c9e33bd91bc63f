//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了熔断期间被跳过或失败的变更的恢复队列。

use crate::metrics::GLOBAL_METRICS;
use crate::protocol::Action;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{debug, warn};

/// 待重放的变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryItem {
    pub key: String,
    pub action: Action,
    pub timestamp: i64,
    /// 已失败的重放次数
    pub attempts: u32,
}

impl RecoveryItem {
    pub fn new(key: impl Into<String>, action: Action, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            action,
            timestamp,
            attempts: 0,
        }
    }
}

/// 入队结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 新增条目
    Queued,
    /// 与已有条目合并，时间戳更新为较大值
    Merged,
    /// 已有条目更新，新条目被忽略
    Superseded,
    /// 队列已满，丢弃了最旧的条目
    Evicted(RecoveryItem),
}

/// 队列内容：按入队序号排列的条目，加上 `(key, action)` 到序号的索引
#[derive(Debug, Default)]
struct Pending {
    next_seq: u64,
    items: BTreeMap<u64, RecoveryItem>,
    index: HashMap<(String, Action), u64>,
}

impl Pending {
    fn take_all(&mut self) -> Vec<RecoveryItem> {
        self.index.clear();
        std::mem::take(&mut self.items).into_values().collect()
    }
}

/// 有界先进先出恢复队列
///
/// 按 `(key, action)` 去重并保留较大的时间戳；队列满时丢弃最旧的条目。
#[derive(Debug)]
pub struct RecoveryQueue {
    cache_name: String,
    label: &'static str,
    capacity: usize,
    pending: Mutex<Pending>,
}

impl RecoveryQueue {
    pub fn new(cache_name: impl Into<String>, label: &'static str, capacity: usize) -> Self {
        Self {
            cache_name: cache_name.into(),
            label,
            capacity: capacity.max(1),
            pending: Mutex::new(Pending::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// 当前内容的快照（最旧的在前）
    pub fn snapshot(&self) -> Vec<RecoveryItem> {
        self.lock().items.values().cloned().collect()
    }

    /// 入队
    pub fn enqueue(&self, item: RecoveryItem) -> EnqueueOutcome {
        let mut pending = self.lock();
        let pending = &mut *pending;

        let slot = (item.key.clone(), item.action);
        if let Some(existing) = pending
            .index
            .get(&slot)
            .and_then(|seq| pending.items.get_mut(seq))
        {
            if item.timestamp > existing.timestamp {
                existing.timestamp = item.timestamp;
                existing.attempts = existing.attempts.min(item.attempts);
                GLOBAL_METRICS.incr(&self.cache_name, self.label, "recovery_merged");
                return EnqueueOutcome::Merged;
            }
            return EnqueueOutcome::Superseded;
        }

        let evicted = if pending.items.len() >= self.capacity {
            pending.items.pop_first().map(|(_, oldest)| {
                pending.index.remove(&(oldest.key.clone(), oldest.action));
                oldest
            })
        } else {
            None
        };
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.index.insert(slot, seq);
        pending.items.insert(seq, item);
        let len = pending.items.len();

        GLOBAL_METRICS.incr(&self.cache_name, self.label, "recovery_enqueued");
        GLOBAL_METRICS.set_queue_length(&self.cache_name, self.label, len);

        match evicted {
            Some(dropped) => {
                GLOBAL_METRICS.incr(&self.cache_name, self.label, "recovery_dropped");
                warn!(
                    cache = %self.cache_name,
                    subsystem = self.label,
                    capacity = self.capacity,
                    "recovery queue full, dropped oldest item"
                );
                EnqueueOutcome::Evicted(dropped)
            }
            None => {
                debug!(cache = %self.cache_name, subsystem = self.label, len, "recovery item queued");
                EnqueueOutcome::Queued
            }
        }
    }

    /// 取出全部条目，每个键只保留时间戳最大的一条
    ///
    /// 结果按保留条目在队列中的位置排序，最旧的在前。
    pub fn drain_latest_per_key(&self) -> Vec<RecoveryItem> {
        let drained = self.lock().take_all();
        GLOBAL_METRICS.set_queue_length(&self.cache_name, self.label, 0);

        let mut latest: HashMap<&str, usize> = HashMap::with_capacity(drained.len());
        for (idx, item) in drained.iter().enumerate() {
            latest
                .entry(item.key.as_str())
                .and_modify(|best| {
                    if item.timestamp >= drained[*best].timestamp {
                        *best = idx;
                    }
                })
                .or_insert(idx);
        }

        let mut keep: Vec<usize> = latest.into_values().collect();
        keep.sort_unstable();
        let collapsed = drained.len() - keep.len();
        if collapsed > 0 {
            GLOBAL_METRICS.incr_by(&self.cache_name, self.label, "recovery_collapsed", collapsed as u64);
        }

        let mut drained: Vec<Option<RecoveryItem>> = drained.into_iter().map(Some).collect();
        keep.into_iter()
            .filter_map(|idx| drained[idx].take())
            .collect()
    }
}
