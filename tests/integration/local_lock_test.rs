//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 进程内分段锁集成测试

use oxcache_backplane::lock::StripedLocker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 50 个并发获取者竞争同一个键，任意时刻最多一个持有者
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let locker = Arc::new(StripedLocker::new("local_mutex", 1024));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let locker = locker.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            let token = locker
                .acquire("hot-key", Duration::from_secs(10), &CancellationToken::new())
                .await
                .expect("lock should be acquired within the timeout");

            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            inside.fetch_sub(1, Ordering::SeqCst);

            locker.release(token);
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 50);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(locker.held_stripes(), 0);
}

/// 键被长时间持有时，短超时的获取很快返回 None
#[tokio::test]
async fn test_short_timeout_against_long_hold() {
    let locker = Arc::new(StripedLocker::new("local_timeout", 1024));
    let token = locker
        .acquire("k", Duration::from_millis(10), &CancellationToken::new())
        .await
        .unwrap();

    let holder = {
        let locker = locker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            locker.release(token);
        })
    };

    let start = Instant::now();
    let second = locker
        .acquire("k", Duration::from_millis(10), &CancellationToken::new())
        .await;
    let elapsed = start.elapsed();

    assert!(second.is_none());
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);

    holder.await.unwrap();
    assert!(locker
        .acquire("k", Duration::from_millis(10), &CancellationToken::new())
        .await
        .is_some());
}

/// 取消的获取返回 None 且不占用分段
#[tokio::test]
async fn test_cancelled_acquire_does_not_leak() {
    let locker = Arc::new(StripedLocker::new("local_cancel", 16));
    let token = locker
        .acquire("k", Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let locker = locker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { locker.acquire("k", Duration::from_secs(30), &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(waiter.await.unwrap().is_none());

    locker.release(token);
    assert_eq!(locker.held_stripes(), 0);
    assert!(locker
        .acquire("k", Duration::ZERO, &CancellationToken::new())
        .await
        .is_some());
}

/// 未显式释放的令牌在 drop 时归还分段
#[tokio::test]
async fn test_dropped_token_releases_stripe() {
    let locker = StripedLocker::new("local_drop", 16);
    {
        let _token = locker
            .acquire("k", Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(locker.held_stripes(), 1);
    }
    assert_eq!(locker.held_stripes(), 0);
}

/// 不同键（落在不同分段时）互不阻塞；阻塞与异步入口共享同一组分段
#[test]
fn test_blocking_entry_from_threads() {
    let locker = Arc::new(StripedLocker::new("local_threads", 1024));
    let counter = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let locker = locker.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let token = locker
                        .acquire_blocking("shared", Duration::from_secs(10))
                        .unwrap();
                    let before = counter.load(Ordering::SeqCst);
                    counter.store(before + 1, Ordering::SeqCst);
                    locker.release(token);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 400);

    let keys: Vec<String> = (0..64).map(|i| format!("key-{}", i)).collect();
    let a = &keys[0];
    let b = keys
        .iter()
        .find(|k| locker.stripe_of(k) != locker.stripe_of(a))
        .unwrap();
    let _ta = locker.acquire_blocking(a, Duration::ZERO).unwrap();
    assert!(locker.acquire_blocking(b, Duration::ZERO).is_some());
}

/// `Duration::MAX` 表示一直等待，直到持有者释放
#[test]
fn test_unbounded_timeout_waits_for_release() {
    let locker = Arc::new(StripedLocker::new("local_unbounded", 16));
    let held = locker.acquire_blocking("k", Duration::ZERO).unwrap();

    let waiter = {
        let locker = locker.clone();
        std::thread::spawn(move || locker.acquire_blocking("k", Duration::MAX).is_some())
    };
    std::thread::sleep(Duration::from_millis(50));
    locker.release(held);
    assert!(waiter.join().unwrap());
}

#[tokio::test]
async fn test_unbounded_async_timeout_waits_for_release() {
    let locker = Arc::new(StripedLocker::new("local_unbounded_async", 16));
    let held = locker
        .acquire("k", Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();

    let waiter = {
        let locker = locker.clone();
        tokio::spawn(async move {
            locker
                .acquire("k", Duration::MAX, &CancellationToken::new())
                .await
                .is_some()
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    locker.release(held);
    assert!(waiter.await.unwrap());
}
