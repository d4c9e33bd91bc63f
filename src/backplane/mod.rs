//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了背板（Backplane）传输抽象：在同一逻辑缓存的各节点之间
//! 通过发布/订阅频道传递失效消息。
//!
//! 所有实现遵循同一契约，可以在配置期互换：
//!
//! * [`MemoryBackplane`] - 进程内扇出，用于测试和单进程多缓存
//! * [`RedisBackplane`] - Redis Pub/Sub
//! * [`NullBackplane`] - 禁用背板

pub mod memory;
pub mod redis;

pub use self::redis::RedisBackplane;
pub use memory::{MemoryBackplane, MemoryHub};

use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::protocol::{self, InvalidationMessage};
use crate::utils::redaction::redact_cache_key;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

/// 构造失效频道名称
pub fn channel_name(prefix: &str) -> String {
    format!("{}.Evict", prefix)
}

/// 背板实例的身份与频道配置
#[derive(Debug, Clone)]
pub struct BackplaneOptions {
    /// 逻辑缓存名称
    pub cache_name: String,
    /// 当前进程的实例ID
    pub instance_id: String,
    /// 频道前缀，缺省时使用缓存名称
    pub channel_prefix: Option<String>,
}

impl BackplaneOptions {
    pub fn new(cache_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            instance_id: instance_id.into(),
            channel_prefix: None,
        }
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = Some(prefix.into());
        self
    }

    /// 订阅和发布使用的频道
    pub fn channel(&self) -> String {
        channel_name(self.channel_prefix.as_deref().unwrap_or(&self.cache_name))
    }

    /// 在任何流量之前校验身份信息
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.is_empty() {
            return Err(CacheError::ConfigError(
                "backplane cache name cannot be empty".to_string(),
            ));
        }
        if self.instance_id.is_empty() {
            return Err(CacheError::ConfigError(
                "backplane instance id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 背板消息的接收方
#[async_trait]
pub trait BackplaneListener: Send + Sync {
    /// 收到一条已解码、已校验、非本实例发出的消息
    async fn on_message(&self, message: InvalidationMessage);

    /// 首次连接或重连成功
    async fn on_connect(&self, is_reconnection: bool);
}

/// 背板传输
#[async_trait]
pub trait Backplane: Send + Sync {
    /// 实现名称
    fn kind(&self) -> &'static str;

    fn options(&self) -> &BackplaneOptions;

    /// 订阅本缓存的失效频道
    ///
    /// 连接断开后自动重连，每次连接成功都会调用 `on_connect`。重复订阅返回
    /// [`CacheError::Misuse`]。
    async fn subscribe(&self, listener: Arc<dyn BackplaneListener>) -> Result<()>;

    /// 取消订阅，可重复调用
    async fn unsubscribe(&self) -> Result<()>;

    /// 发布消息
    async fn publish(&self, message: &InvalidationMessage, cancel: &CancellationToken)
        -> Result<()>;

    /// 阻塞发布消息
    fn publish_blocking(&self, message: &InvalidationMessage) -> Result<()>;

    /// 一次真实的往返，用于熔断探测
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;
}

/// 分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 已交给监听者
    Delivered,
    /// 字节无法解码
    Malformed,
    /// 语义无效
    Invalid,
    /// 本实例发出的消息
    SelfOriginated,
}

/// 接收侧的公共处理：解码、校验、过滤本实例消息，然后交给独立任务处理
///
/// 分发从不阻塞接收循环，监听者在自己的任务中执行。
#[derive(Clone)]
pub struct Dispatcher {
    cache_name: Arc<str>,
    instance_id: Arc<str>,
    listener: Arc<dyn BackplaneListener>,
    handle: Handle,
}

impl Dispatcher {
    /// 创建分发器，必须在 tokio 运行时内调用
    pub fn new(options: &BackplaneOptions, listener: Arc<dyn BackplaneListener>) -> Self {
        Self {
            cache_name: Arc::from(options.cache_name.as_str()),
            instance_id: Arc::from(options.instance_id.as_str()),
            listener,
            handle: Handle::current(),
        }
    }

    /// 处理一条原始负载
    pub fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let message = match protocol::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                GLOBAL_METRICS.incr(&self.cache_name, "backplane", "receive_malformed");
                debug!(cache = %self.cache_name, error = %e, "dropping malformed backplane payload");
                return DispatchOutcome::Malformed;
            }
        };

        if !message.is_valid() {
            GLOBAL_METRICS.incr(&self.cache_name, "backplane", "receive_invalid");
            debug!(cache = %self.cache_name, ?message, "dropping invalid backplane message");
            return DispatchOutcome::Invalid;
        }

        if message.is_from(&self.instance_id) {
            trace!(cache = %self.cache_name, "ignoring self-originated message");
            return DispatchOutcome::SelfOriginated;
        }

        GLOBAL_METRICS.incr(&self.cache_name, "backplane", "receive");
        let span = debug_span!(
            "backplane_receive",
            cache = %self.cache_name,
            source = %message.source_id(),
            action = %message.action(),
            key = %redact_cache_key(message.cache_key()),
        );
        let listener = self.listener.clone();
        self.handle
            .spawn(async move { listener.on_message(message).await }.instrument(span));
        DispatchOutcome::Delivered
    }

    /// 通知监听者连接已建立
    pub fn connected(&self, is_reconnection: bool) {
        GLOBAL_METRICS.incr(
            &self.cache_name,
            "backplane",
            if is_reconnection { "reconnect" } else { "connect" },
        );
        let listener = self.listener.clone();
        self.handle
            .spawn(async move { listener.on_connect(is_reconnection).await });
    }
}

/// 禁用背板时使用的空实现
#[derive(Debug, Clone)]
pub struct NullBackplane {
    options: BackplaneOptions,
}

impl NullBackplane {
    pub fn new(options: BackplaneOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Backplane for NullBackplane {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn options(&self) -> &BackplaneOptions {
        &self.options
    }

    async fn subscribe(&self, _listener: Arc<dyn BackplaneListener>) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(
        &self,
        _message: &InvalidationMessage,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    fn publish_blocking(&self, _message: &InvalidationMessage) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}
