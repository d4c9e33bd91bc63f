//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! oxcache-backplane - 多节点缓存协调层
//!
//! 为多实例缓存提供跨节点失效（背板）、按键互斥锁（进程内与分布式），
//! 以及保护外部依赖的熔断与自动恢复。

#![doc(html_root_url = "https://docs.rs/oxcache-backplane/0.1.0")]

pub use tokio;

pub mod backend;
pub mod backplane;
pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod recovery;
pub mod sync;
pub mod telemetry;
pub mod utils;

// Re-export commonly used items
pub use backplane::{Backplane, BackplaneListener, BackplaneOptions, MemoryHub};
pub use config::Config;
pub use error::{CacheError, Result};
pub use lock::{DistributedLockToken, DistributedLocker, LocalLockToken, StripedLocker};
pub use manager::{CacheNode, CacheRegistry, NodeBuilder};
pub use protocol::{Action, InvalidationMessage};
pub use recovery::{ResilienceController, Subsystem};
pub use sync::InvalidationHandler;

/// oxcache-backplane 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
