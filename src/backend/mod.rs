//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了外部服务的连接提供者。

pub mod redis_provider;

pub use redis_provider::{DefaultRedisProvider, RedisProvider};
