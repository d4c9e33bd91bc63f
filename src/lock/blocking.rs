//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 分布式锁的阻塞门面，建立在异步实现之上。
//!
//! 阻塞调用会占用调用线程直到异步操作完成。在多线程运行时的工作线程上
//! 调用时使用 `block_in_place` 让出工作线程；在单线程运行时上调用会死锁，
//! 因此直接返回 [`CacheError::Misuse`]。频繁在工作线程上阻塞会挤占运行时
//! 线程，能使用异步接口时应优先使用异步接口。

use super::{DistributedLockToken, DistributedLocker};
use crate::error::{CacheError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 阻塞式分布式锁
#[derive(Clone)]
pub struct BlockingLocker {
    inner: Arc<dyn DistributedLocker>,
    handle: Handle,
}

impl BlockingLocker {
    /// 创建阻塞门面
    ///
    /// # 参数
    ///
    /// * `inner` - 异步分布式锁
    /// * `handle` - 执行异步操作的运行时句柄
    pub fn new(inner: Arc<dyn DistributedLocker>, handle: Handle) -> Self {
        Self { inner, handle }
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                Err(CacheError::Misuse(
                    "blocking lock call on a current-thread runtime would deadlock".to_string(),
                ))
            }
            Ok(_) => Ok(tokio::task::block_in_place(|| self.handle.block_on(fut))),
            Err(_) => Ok(self.handle.block_on(fut)),
        }
    }

    /// 阻塞获取锁
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<Option<DistributedLockToken>> {
        let cancel = CancellationToken::new();
        self.block_on(self.inner.acquire(key, timeout, &cancel))
    }

    /// 阻塞释放锁，从不报错
    pub fn release(&self, token: DistributedLockToken) {
        if let Err(e) = self.block_on(self.inner.release(token)) {
            warn!(error = %e, "blocking release skipped, lock will expire after abandon timeout");
        }
    }
}
