//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的错误类型和处理机制。

use thiserror::Error;

/// 协调层错误类型枚举
///
/// 传输层的瞬时故障不会越过子系统边界，它们在内部被转换为
/// "未获取" / 熔断 / 入队；这里的错误主要面向配置期和内部状态流转。
#[derive(Error, Debug)]
pub enum CacheError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 使用方式错误（例如重复订阅）
    #[error("Misuse: {0}")]
    Misuse(String),

    /// 背板（Backplane）传输失败
    #[error("Backplane error: {0}")]
    Backplane(String),

    /// 子系统熔断中，调用被跳过
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// Redis错误
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 操作被取消
    #[error("Operation cancelled")]
    Cancelled,

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// 协调层操作结果类型别名
pub type Result<T> = std::result::Result<T, CacheError>;
