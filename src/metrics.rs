//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的指标收集，供外部导出器采集。

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 指标收集器
///
/// 计数器键格式为 `cache:component:event`，例如 `orders:backplane:publish`
#[derive(Clone, Debug)]
pub struct Metrics {
    enabled: Arc<AtomicBool>,
    /// 事件计数
    pub counters: Arc<Mutex<HashMap<String, u64>>>,
    /// 熔断状态（0: Closed, 1: Open），键为 `cache:subsystem`
    pub circuit_state: Arc<Mutex<HashMap<String, u8>>>,
    /// 恢复队列长度，键为 `cache:subsystem`
    pub queue_length: Arc<Mutex<HashMap<String, usize>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            counters: Arc::default(),
            circuit_state: Arc::default(),
            queue_length: Arc::default(),
        }
    }
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Metrics {
    /// 开启或关闭指标收集
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// 记录一次事件
    ///
    /// # 参数
    ///
    /// * `cache` - 缓存名称
    /// * `component` - 组件（backplane/lock/circuit/queue）
    /// * `event` - 事件名称
    pub fn incr(&self, cache: &str, component: &str, event: &str) {
        self.incr_by(cache, component, event, 1);
    }

    pub fn incr_by(&self, cache: &str, component: &str, event: &str, n: u64) {
        if !self.is_enabled() || n == 0 {
            return;
        }
        let key = format!("{}:{}:{}", cache, component, event);
        *guard(&self.counters).entry(key).or_insert(0) += n;
    }

    /// 读取计数器
    pub fn counter(&self, cache: &str, component: &str, event: &str) -> u64 {
        let key = format!("{}:{}:{}", cache, component, event);
        guard(&self.counters).get(&key).copied().unwrap_or(0)
    }

    /// 设置熔断状态
    pub fn set_circuit_open(&self, cache: &str, subsystem: &str, open: bool) {
        if !self.is_enabled() {
            return;
        }
        guard(&self.circuit_state).insert(format!("{}:{}", cache, subsystem), open as u8);
    }

    /// 设置恢复队列长度
    pub fn set_queue_length(&self, cache: &str, subsystem: &str, len: usize) {
        if !self.is_enabled() {
            return;
        }
        guard(&self.queue_length).insert(format!("{}:{}", cache, subsystem), len);
    }

    /// 清除某个缓存的全部指标
    pub fn remove_cache(&self, cache: &str) {
        let prefix = format!("{}:", cache);
        guard(&self.counters).retain(|k, _| !k.starts_with(&prefix));
        guard(&self.circuit_state).retain(|k, _| !k.starts_with(&prefix));
        guard(&self.queue_length).retain(|k, _| !k.starts_with(&prefix));
    }
}

/// 获取指标字符串
///
/// 以 Prometheus 文本格式输出所有指标
pub fn get_metrics_string() -> String {
    render(&GLOBAL_METRICS)
}

/// 以 Prometheus 文本格式渲染指定的指标实例
pub fn render(metrics: &Metrics) -> String {
    let mut output = String::new();

    let mut counters: Vec<(String, u64)> = guard(&metrics.counters)
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect();
    counters.sort();
    for (k, v) in counters {
        let parts: Vec<&str> = k.splitn(3, ':').collect();
        if parts.len() == 3 {
            output.push_str(&format!(
                "backplane_events_total{{cache=\"{}\", component=\"{}\", event=\"{}\"}} {}\n",
                parts[0], parts[1], parts[2], v
            ));
        }
    }

    render_gauges(&mut output, "backplane_circuit_open", &metrics.circuit_state);
    render_gauges(
        &mut output,
        "backplane_recovery_queue_length",
        &metrics.queue_length,
    );

    output
}

fn render_gauges<V: ToString>(output: &mut String, name: &str, map: &Mutex<HashMap<String, V>>) {
    let map = guard(map);
    let mut gauges: Vec<(&String, String)> = map.iter().map(|(k, v)| (k, v.to_string())).collect();
    gauges.sort();
    for (k, v) in gauges {
        if let Some((cache, subsystem)) = k.split_once(':') {
            output.push_str(&format!(
                "{}{{cache=\"{}\", subsystem=\"{}\"}} {}\n",
                name, cache, subsystem, v
            ));
        }
    }
}
