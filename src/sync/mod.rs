//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存系统的同步机制，包括失效消息的发布、订阅和时间戳来源。

pub mod clock;
pub mod invalidation;

pub use clock::TimestampSource;
pub use invalidation::{InvalidationHandler, InvalidationPublisher, InvalidationSubscriber};
