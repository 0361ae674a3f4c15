//! 协调器能力契约
//!
//! 系统只依赖这里定义的能力集（get/put/delete/range/watch/lease/CAS/inc），
//! 不绑定具体的存储厂商。watch 事件按版本号严格有序投递。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use crond_core::CrondResult;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// 一条 watch 事件；DELETE 事件的 value 为空串
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: String,
    pub revision: i64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = CrondResult<WatchEvent>> + Send>>;

/// 可监听的带租约 KV 存储
///
/// 所有操作都可能阻塞在网络 IO 上，但不得持有应用侧状态锁。
/// 实现必须可在多任务间并发共享。
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn get(&self, key: &str) -> CrondResult<Option<KeyValue>>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CrondResult<()>;

    async fn delete(&self, key: &str) -> CrondResult<()>;

    /// 前缀范围读，同时返回读取时刻的版本号，供 watch 续传使用
    async fn range(&self, prefix: &str) -> CrondResult<(Vec<KeyValue>, i64)>;

    /// 自 `from_revision`（含）起监听前缀下的变更
    ///
    /// 起始版本已被压缩时返回 `ErrCompactedRevision`，
    /// 调用方应回退到全量快照后重新监听。
    async fn watch(&self, prefix: &str, from_revision: i64) -> CrondResult<WatchStream>;

    async fn lease_grant(&self, ttl_seconds: i64) -> CrondResult<LeaseId>;

    async fn lease_keep_alive(&self, lease: LeaseId) -> CrondResult<()>;

    /// 吊销租约并删除其绑定的所有键；对未知租约幂等
    async fn lease_revoke(&self, lease: LeaseId) -> CrondResult<()>;

    /// 事务化的「键不存在才写入」，写入成功返回 true
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> CrondResult<bool>;

    /// 事务化自增计数器，返回自增后的值
    async fn inc(&self, key: &str) -> CrondResult<i64>;
}

/// 把 mpsc 接收端适配成 watch 流
pub(crate) struct ChannelWatchStream {
    rx: mpsc::UnboundedReceiver<CrondResult<WatchEvent>>,
}

impl ChannelWatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<CrondResult<WatchEvent>>) -> Self {
        Self { rx }
    }
}

impl Stream for ChannelWatchStream {
    type Item = CrondResult<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 租约保活驱动
///
/// 以约 TTL/3 的节奏续约，句柄销毁即停止保活；
/// 锁与注册的生命周期都由它托管，保证所有退出路径都能放手。
pub struct LeaseKeeper {
    lease: LeaseId,
    handle: tokio::task::JoinHandle<()>,
}

impl LeaseKeeper {
    pub fn spawn(coordinator: Arc<dyn Coordinator>, lease: LeaseId, ttl_seconds: i64) -> Self {
        let period = Duration::from_millis(ttl_seconds.max(1) as u64 * 1000 / 3);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval 的首个 tick 立即返回，相当于一次提前续约
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.lease_keep_alive(lease).await {
                    warn!("租约 {} 续约失败: {}", lease, e);
                }
            }
        });
        Self { lease, handle }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
