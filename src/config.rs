//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// 顶层配置
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub config_version: Option<u32>,
    #[serde(default)]
    pub global: GlobalConfig,
    /// 按逻辑缓存名称索引的缓存配置
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
}

/// 全局配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GlobalConfig {
    /// 是否启用指标收集
    pub enable_metrics: bool,
    /// 日志过滤表达式（EnvFilter 语法）
    pub log_filter: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_filter: "info".to_string(),
        }
    }
}

/// 单个逻辑缓存的配置
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// 实例ID，缺省时生成 UUID
    pub instance_id: Option<String>,
    /// 频道前缀，缺省时使用缓存名称
    pub channel_prefix: Option<String>,
    pub backplane: BackplaneConfig,
    pub distributed_lock: DistributedLockConfig,
    pub local_lock: LocalLockConfig,
    pub resilience: ResilienceConfig,
    pub invalidation: InvalidationConfig,
}

/// 背板类型
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackplaneKind {
    /// 禁用背板
    #[default]
    #[serde(alias = "disabled")]
    None,
    /// 进程内背板
    Memory,
    /// Redis Pub/Sub 背板
    Redis,
}

/// 背板配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BackplaneConfig {
    pub kind: BackplaneKind,
    /// Redis 连接配置，`kind = "redis"` 时必填
    pub redis: Option<RedisConfig>,
    /// 断线重连退避上限（毫秒）
    pub max_reconnect_backoff_ms: u64,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            kind: BackplaneKind::None,
            redis: None,
            max_reconnect_backoff_ms: 30_000,
        }
    }
}

/// 分布式锁类型
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    #[default]
    #[serde(alias = "disabled")]
    None,
    /// 无连接的进程内实现，用于本地集成测试
    Memory,
    Redis,
}

/// 分布式锁配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DistributedLockConfig {
    pub kind: LockKind,
    pub redis: Option<RedisConfig>,
    /// 持有者崩溃后锁自动可回收的时长（毫秒）
    pub abandon_timeout_ms: u64,
    /// 获取锁时的轮询间隔（毫秒）
    pub retry_interval_ms: u64,
    /// 后台重连间隔（毫秒）
    pub reconnect_interval_ms: u64,
    /// 进程内实现中空闲锁槽的滑动过期时间（毫秒）
    pub idle_eviction_ms: u64,
}

impl Default for DistributedLockConfig {
    fn default() -> Self {
        Self {
            kind: LockKind::None,
            redis: None,
            abandon_timeout_ms: 30_000,
            retry_interval_ms: 50,
            reconnect_interval_ms: 5_000,
            idle_eviction_ms: 120_000,
        }
    }
}

impl DistributedLockConfig {
    pub fn abandon_timeout(&self) -> Duration {
        Duration::from_millis(self.abandon_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_ms)
    }
}

/// 本地锁配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LocalLockConfig {
    /// 分段数量，向上取整为2的幂
    pub stripes: usize,
}

impl Default for LocalLockConfig {
    fn default() -> Self {
        Self { stripes: 1024 }
    }
}

/// 熔断与自动恢复配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ResilienceConfig {
    /// 连续失败多少次后熔断
    pub failure_threshold: u32,
    /// 滑动窗口失败率阈值（0-1），None 表示只看连续失败
    pub failure_ratio: Option<f64>,
    /// 滑动窗口大小
    pub window_size: usize,
    /// 失败率判定所需的最少调用数
    pub min_calls: usize,
    /// 后台探测间隔（毫秒）
    pub probe_interval_ms: u64,
    /// 恢复队列容量
    pub queue_capacity: usize,
    /// 单条恢复项的最大重放次数
    pub max_replay_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_ratio: None,
            window_size: 20,
            min_calls: 10,
            probe_interval_ms: 5_000,
            queue_capacity: 10_000,
            max_replay_attempts: 3,
        }
    }
}

impl ResilienceConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// 失效处理配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct InvalidationConfig {
    /// 丢弃比已应用消息更旧的消息（按键最后写入者胜出）
    pub ignore_stale: bool,
    /// 跟踪最近时间戳的键数量上限
    pub stale_tracking_capacity: u64,
    /// 后台发布（调用方不等待发布结果）
    pub background_publish: bool,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            ignore_stale: true,
            stale_tracking_capacity: 100_000,
            background_publish: true,
        }
    }
}

/// Redis模式枚举
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// 单机模式
    #[default]
    Standalone,
    /// 哨兵模式
    Sentinel,
}

/// Redis 连接配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisConfig {
    pub mode: RedisMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
    /// Redis 密码（可选）
    pub password: Option<SecretString>,
    /// 是否启用 TLS
    pub enable_tls: bool,
    /// 哨兵配置
    pub sentinel: Option<SentinelConfig>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
            password: None,
            enable_tls: false,
            sentinel: None,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// 哨兵配置
#[derive(Deserialize, Clone, Debug)]
pub struct SentinelConfig {
    /// 主节点名称
    pub master_name: String,
    /// 哨兵节点列表
    pub nodes: Vec<String>,
}

impl Config {
    /// 从TOML字符串解析配置并校验
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| CacheError::ConfigError(e.to_string()))?;
        config.validate().map_err(CacheError::ConfigError)?;
        Ok(config)
    }

    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// 验证配置
    ///
    /// 检查所有必需字段都已设置，并且取值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        for (name, cache) in &self.caches {
            cache.validate(name)?;
        }

        Ok(())
    }
}

impl CacheConfig {
    /// 校验单个缓存的配置
    pub fn validate(&self, name: &str) -> std::result::Result<(), String> {
        if name.is_empty() {
            return Err("Cache name cannot be empty".to_string());
        }

        if name.len() > 64 {
            return Err(format!(
                "Cache name '{}' exceeds maximum length of 64 characters",
                name
            ));
        }

        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(format!("Cache '{}' instance_id cannot be blank", name));
            }
        }

        if let Some(prefix) = &self.channel_prefix {
            if prefix.is_empty() {
                return Err(format!("Cache '{}' channel_prefix cannot be empty", name));
            }
        }

        if self.backplane.kind == BackplaneKind::Redis {
            let redis = self.backplane.redis.as_ref().ok_or_else(|| {
                format!("Cache '{}' uses a redis backplane without [backplane.redis]", name)
            })?;
            validate_redis(name, redis)?;
        }

        if self.backplane.max_reconnect_backoff_ms < 1000 {
            return Err(format!(
                "Cache '{}' max_reconnect_backoff_ms must be at least 1000 ms",
                name
            ));
        }

        let lock = &self.distributed_lock;
        if lock.kind != LockKind::None {
            if lock.abandon_timeout_ms == 0 {
                return Err(format!("Cache '{}' abandon_timeout_ms cannot be zero", name));
            }
            if lock.retry_interval_ms == 0 {
                return Err(format!("Cache '{}' retry_interval_ms cannot be zero", name));
            }
        }
        if lock.kind == LockKind::Redis {
            let redis = lock.redis.as_ref().ok_or_else(|| {
                format!(
                    "Cache '{}' uses a redis lock without [distributed_lock.redis]",
                    name
                )
            })?;
            validate_redis(name, redis)?;
            if lock.reconnect_interval_ms == 0 {
                return Err(format!(
                    "Cache '{}' reconnect_interval_ms cannot be zero",
                    name
                ));
            }
        }
        if lock.kind == LockKind::Memory && lock.idle_eviction_ms <= lock.abandon_timeout_ms {
            // 空闲淘汰早于放弃超时会让仍被持有的锁槽被替换
            return Err(format!(
                "Cache '{}' idle_eviction_ms ({}) must be greater than abandon_timeout_ms ({})",
                name, lock.idle_eviction_ms, lock.abandon_timeout_ms
            ));
        }

        if self.local_lock.stripes == 0 || self.local_lock.stripes > 1 << 16 {
            return Err(format!(
                "Cache '{}' local_lock.stripes must be between 1 and 65536",
                name
            ));
        }

        let resilience = &self.resilience;
        if resilience.failure_threshold == 0 {
            return Err(format!("Cache '{}' failure_threshold cannot be zero", name));
        }
        if let Some(ratio) = resilience.failure_ratio {
            if ratio <= 0.0 || ratio > 1.0 {
                return Err(format!(
                    "Cache '{}' failure_ratio must be in (0, 1]",
                    name
                ));
            }
            if resilience.window_size == 0 || resilience.min_calls > resilience.window_size {
                return Err(format!(
                    "Cache '{}' min_calls must be <= window_size and window_size > 0",
                    name
                ));
            }
        }
        if !(10..=3_600_000).contains(&resilience.probe_interval_ms) {
            return Err(format!(
                "Cache '{}' probe_interval_ms must be between 10 and 3600000 ms",
                name
            ));
        }
        if resilience.queue_capacity == 0 {
            return Err(format!("Cache '{}' queue_capacity cannot be zero", name));
        }

        if self.invalidation.ignore_stale && self.invalidation.stale_tracking_capacity == 0 {
            return Err(format!(
                "Cache '{}' stale_tracking_capacity cannot be zero when ignore_stale is on",
                name
            ));
        }

        Ok(())
    }
}

fn validate_redis(name: &str, redis: &RedisConfig) -> std::result::Result<(), String> {
    if !(100..=30000).contains(&redis.connection_timeout_ms) {
        return Err(format!(
            "Cache '{}' connection_timeout_ms must be between 100 and 30000 ms",
            name
        ));
    }
    if !(100..=60000).contains(&redis.command_timeout_ms) {
        return Err(format!(
            "Cache '{}' command_timeout_ms must be between 100 and 60000 ms",
            name
        ));
    }
    if redis.mode == RedisMode::Sentinel && redis.sentinel.is_none() {
        return Err(format!(
            "Cache '{}' sentinel mode requires a [sentinel] section",
            name
        ));
    }
    Ok(())
}
