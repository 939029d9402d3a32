//! 订单级进程内互斥锁
//!
//! 同一订单的授权与扣款串行执行。锁按需创建，最后一个持有者释放时从表中移除，
//! 表的大小只与当前并发中的订单数相关。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 订单锁表
#[derive(Default)]
pub struct OrderLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OrderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取订单锁，等待期间其他请求仍可进入同一订单的等待队列
    pub async fn acquire(&self, order_id: &str) -> OrderLockGuard<'_> {
        let lock = self
            .locks
            .entry(order_id.to_string())
            .or_default()
            .clone();

        OrderLockGuard {
            locks: &self.locks,
            order_id: order_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// 当前表中的订单锁数量
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// 订单锁守卫，drop 时释放锁并清理无人引用的表项
pub struct OrderLockGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    order_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderLockGuard<'_> {
    fn drop(&mut self) {
        // 先释放守卫持有的 Arc，引用计数为 1 说明只剩表本身
        self.guard.take();
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = OrderLocks::new();

        let guard = locks.acquire("O1").await;
        assert_eq!(locks.len(), 1);
        drop(guard);

        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(OrderLocks::new());
        let first = locks.acquire("O1").await;

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.acquire("O1").await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_order_is_serialized() {
        let locks = Arc::new(OrderLocks::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _guard = locks.acquire("O1").await;
                    let inside = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(inside, 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(locks.is_empty());
    }
}
