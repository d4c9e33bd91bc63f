//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 统一工具模块
//!
//! 提供测试、基准和命令行共用的工具函数，包括：
//! - 日志设置工具
//! - Redis连接检查工具
//! - 缓存名称生成工具
//! - 输入验证工具

pub mod redaction;

use crate::config::{BackplaneConfig, BackplaneKind, CacheConfig, RedisConfig};
use crate::error::CacheError;
use secrecy::SecretString;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// 测试用的日志初始化，可重复调用
pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .try_init()
            .ok();
    });
}

/// 检查是否允许运行依赖Redis的测试
pub fn is_redis_available() -> bool {
    std::env::var("OXCACHE_SKIP_REDIS_TESTS").is_err()
}

/// 测试使用的Redis地址
pub fn redis_test_url() -> String {
    std::env::var("OXCACHE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// 检查指定URL的Redis是否可用
pub async fn is_redis_available_url(url: &str) -> bool {
    let client = match redis::Client::open(url) {
        Ok(c) => c,
        Err(_) => return false,
    };

    match tokio::time::timeout(
        Duration::from_secs(1),
        client.get_multiplexed_async_connection(),
    )
    .await
    {
        Ok(Ok(_)) => true,
        Ok(Err(_)) => false,
        Err(_) => false,
    }
}

/// 等待Redis可用
pub async fn wait_for_redis(url: &str, timeout: Duration) -> bool {
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if is_redis_available_url(url).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// 生成唯一的缓存名称
pub fn generate_unique_name(base: &str) -> String {
    format!("{}_{}", base, uuid::Uuid::new_v4().simple())
}

/// 创建使用Redis背板的缓存配置
pub fn create_redis_backplane_config(url: &str) -> CacheConfig {
    CacheConfig {
        backplane: BackplaneConfig {
            kind: BackplaneKind::Redis,
            redis: Some(RedisConfig {
                connection_string: SecretString::new(url.to_string().into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 创建使用进程内背板的缓存配置
pub fn create_memory_backplane_config() -> CacheConfig {
    CacheConfig {
        backplane: BackplaneConfig {
            kind: BackplaneKind::Memory,
            ..Default::default()
        },
        ..Default::default()
    }
}

const MAX_CACHE_KEY_LENGTH: usize = 1024;

/// 校验缓存键
///
/// 键不能为空，长度受限，且不能包含控制字符。
pub fn validate_cache_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::Misuse("Cache key cannot be empty".to_string()));
    }

    if key.len() > MAX_CACHE_KEY_LENGTH {
        return Err(CacheError::Misuse(format!(
            "Cache key exceeds maximum length of {} bytes (got {} bytes)",
            MAX_CACHE_KEY_LENGTH,
            key.len()
        )));
    }

    if let Some(c) = key.chars().find(|c| c.is_control()) {
        return Err(CacheError::Misuse(format!(
            "Cache key contains control character {:?}",
            c
        )));
    }

    Ok(())
}
