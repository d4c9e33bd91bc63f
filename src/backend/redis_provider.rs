//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis连接提供者接口和默认实现。

use crate::{
    config::{RedisConfig, RedisMode},
    error::{CacheError, Result},
    utils::redaction::redact_connection_string,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use tokio::time::timeout;

/// Redis连接提供者
///
/// 背板和分布式锁通过它获取连接，测试可以注入失败的实现。
#[async_trait]
pub trait RedisProvider: Send + Sync {
    /// 构造客户端（不建立连接）
    fn client(&self, config: &RedisConfig) -> Result<Client>;

    /// 建立可自动重连的连接管理器
    async fn connection_manager(&self, config: &RedisConfig) -> Result<ConnectionManager>;
}

pub struct DefaultRedisProvider;

impl DefaultRedisProvider {
    fn standalone_url(config: &RedisConfig) -> String {
        let connection_string = config.connection_string.expose_secret();
        if config.enable_tls && !connection_string.starts_with("rediss://") {
            connection_string.replace("redis://", "rediss://")
        } else {
            connection_string.to_string()
        }
    }

    fn sentinel_url(config: &RedisConfig) -> Result<String> {
        let sentinel_config = config.sentinel.as_ref().ok_or_else(|| {
            CacheError::ConfigError("Sentinel configuration is missing".to_string())
        })?;

        // redis+sentinel://[:password@]host:port[,host:port]/service_name
        let mut url = "redis+sentinel://".to_string();

        if let Some(password) = &config.password {
            url.push_str(&format!(":{}@", password.expose_secret()));
        }

        let nodes: Vec<String> = sentinel_config
            .nodes
            .iter()
            .map(|n| {
                n.trim_start_matches("redis://")
                    .trim_start_matches("redis+sentinel://")
                    .to_string()
            })
            .collect();

        if nodes.is_empty() {
            return Err(CacheError::ConfigError(
                "No sentinel nodes provided".to_string(),
            ));
        }

        url.push_str(&nodes.join(","));
        url.push('/');
        url.push_str(&sentinel_config.master_name);
        Ok(url)
    }
}

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    fn client(&self, config: &RedisConfig) -> Result<Client> {
        let url = match config.mode {
            RedisMode::Standalone => Self::standalone_url(config),
            RedisMode::Sentinel => Self::sentinel_url(config)?,
        };
        Ok(Client::open(url.as_str())?)
    }

    async fn connection_manager(&self, config: &RedisConfig) -> Result<ConnectionManager> {
        let client = self.client(config)?;
        match timeout(config.connection_timeout(), client.get_connection_manager()).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(CacheError::Timeout(format!(
                "Connection timed out after {}ms. Target: {}",
                config.connection_timeout_ms,
                redact_connection_string(config.connection_string.expose_secret())
            ))),
        }
    }
}
