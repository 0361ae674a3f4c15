//! 分布式任务锁
//!
//! 「键不存在才写入」的 CAS 加上租约 TTL，保证同一 (项目, 任务)
//! 全局至多一个持有者；持有方崩溃后锁随租约到期自动释放。
//! 锁是一个句柄：保活随句柄存活，句柄销毁即放手。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crond_core::keys::{encode, KeyMaker};
use crond_core::{CrondError, CrondResult};

use crate::kv::{Coordinator, LeaseId, LeaseKeeper};

/// 锁键的值：持有者身份
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub agent_ip: String,
    pub lease_id: LeaseId,
}

pub struct TaskLock {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    agent_ip: String,
    ttl_seconds: i64,
    keeper: Option<LeaseKeeper>,
}

impl TaskLock {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keys: &KeyMaker,
        project_id: i64,
        task_id: &str,
        agent_ip: &str,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            coordinator,
            key: keys.lock_key(project_id, task_id),
            agent_ip: agent_ip.to_string(),
            ttl_seconds,
            keeper: None,
        }
    }

    /// 尝试加锁
    ///
    /// 其他节点已持有时返回 `ErrAlreadyLocked`；传输失败返回
    /// `ErrCoordinatorUnavailable`。已持有本锁时幂等返回成功。
    pub async fn try_lock(&mut self) -> CrondResult<()> {
        if self.keeper.is_some() {
            return Ok(());
        }

        let lease = self.coordinator.lease_grant(self.ttl_seconds).await?;
        let owner = encode(&LockOwner {
            agent_ip: self.agent_ip.clone(),
            lease_id: lease,
        })?;

        match self.coordinator.put_if_absent(&self.key, &owner, Some(lease)).await {
            Ok(true) => {
                debug!("获得任务锁 {}", self.key);
                self.keeper = Some(LeaseKeeper::spawn(
                    Arc::clone(&self.coordinator),
                    lease,
                    self.ttl_seconds,
                ));
                Ok(())
            }
            Ok(false) => {
                let _ = self.coordinator.lease_revoke(lease).await;
                Err(CrondError::AlreadyLocked)
            }
            Err(e) => {
                let _ = self.coordinator.lease_revoke(lease).await;
                Err(e)
            }
        }
    }

    /// 释放锁：吊销租约即删除锁键。幂等。
    pub async fn unlock(&mut self) -> CrondResult<()> {
        if let Some(keeper) = self.keeper.take() {
            debug!("释放任务锁 {}", self.key);
            self.coordinator.lease_revoke(keeper.lease()).await?;
        }
        Ok(())
    }

    /// 仅本地视图，不访问网络
    pub fn is_held(&self) -> bool {
        self.keeper.is_some()
    }

    /// 模拟持有方崩溃：停掉保活但不吊销租约，锁键留待 TTL 到期
    #[cfg(test)]
    fn abandon(&mut self) {
        self.keeper.take();
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        // 保活随 keeper 一起停止；尽力吊销，失败则等租约自然到期
        if let Some(keeper) = self.keeper.take() {
            let coordinator = Arc::clone(&self.coordinator);
            let lease = keeper.lease();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = coordinator.lease_revoke(lease).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crond_core::KeyMaker;

    use crate::memory::MemoryCoordinator;

    fn setup() -> (Arc<dyn Coordinator>, KeyMaker) {
        (
            Arc::new(MemoryCoordinator::new()) as Arc<dyn Coordinator>,
            KeyMaker::new("/crond"),
        )
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (coord, keys) = setup();
        let mut a = TaskLock::new(Arc::clone(&coord), &keys, 1, "t", "10.0.0.1", 5);
        let mut b = TaskLock::new(Arc::clone(&coord), &keys, 1, "t", "10.0.0.2", 5);

        a.try_lock().await.unwrap();
        assert!(a.is_held());
        let err = b.try_lock().await.unwrap_err();
        assert!(matches!(err, CrondError::AlreadyLocked));
        assert!(!b.is_held());

        a.unlock().await.unwrap();
        assert!(!a.is_held());
        b.try_lock().await.unwrap();
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_contention_one_winner() {
        let (coord, keys) = setup();
        let mut handles = Vec::new();
        for i in 0..8 {
            let coord = Arc::clone(&coord);
            let keys = keys.clone();
            handles.push(tokio::spawn(async move {
                let mut lock =
                    TaskLock::new(coord, &keys, 1, "t", &format!("10.0.0.{i}"), 5);
                let won = lock.try_lock().await.is_ok();
                // 持住一会儿保证竞争窗口重叠
                tokio::time::sleep(Duration::from_millis(500)).await;
                if won {
                    lock.unlock().await.unwrap();
                }
                won
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "同一时刻只允许一个持有者");
    }

    #[tokio::test]
    async fn test_unlock_idempotent() {
        let (coord, keys) = setup();
        let mut lock = TaskLock::new(coord, &keys, 1, "t", "10.0.0.1", 5);
        lock.try_lock().await.unwrap();
        lock.unlock().await.unwrap();
        lock.unlock().await.unwrap();
        lock.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_recovery_via_lease_expiry() {
        let (coord, keys) = setup();
        let mut dead = TaskLock::new(Arc::clone(&coord), &keys, 1, "t", "10.0.0.1", 1);
        dead.try_lock().await.unwrap();
        dead.abandon();

        // 保活停止后其他节点暂时仍拿不到锁
        let mut next = TaskLock::new(Arc::clone(&coord), &keys, 1, "t", "10.0.0.2", 5);
        assert!(matches!(
            next.try_lock().await.unwrap_err(),
            CrondError::AlreadyLocked
        ));

        // 租约 1 秒到期后锁应可被再次获取
        tokio::time::sleep(Duration::from_millis(1500)).await;
        next.try_lock().await.unwrap();
        next.unlock().await.unwrap();
    }
}
