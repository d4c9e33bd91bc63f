//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了弹性机制：熔断器、恢复队列和后台探测。

pub mod circuit;
pub mod controller;
pub mod queue;

pub use circuit::{CircuitBreaker, CircuitState, Subsystem};
pub use controller::{CallOutcome, DrainReport, RecoveryTarget, ResilienceController};
pub use queue::{EnqueueOutcome, RecoveryItem, RecoveryQueue};
