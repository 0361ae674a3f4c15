//! 内存协调器
//!
//! 面向嵌入式部署与测试的完整实现：版本号单调递增、watch 事件按
//! 版本号顺序投递、租约到期自动删除绑定键。事件历史有界，越过
//! 窗口的续传请求返回压缩错误，以便调用方走全量快照回退路径。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crond_core::{CrondError, CrondResult};

use crate::kv::{
    ChannelWatchStream, Coordinator, EventType, KeyValue, LeaseId, WatchEvent, WatchStream,
};

const HISTORY_LIMIT: usize = 4096;
const SWEEP_PERIOD: Duration = Duration::from_millis(100);

struct StoredValue {
    value: String,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct WatcherReg {
    prefix: String,
    tx: mpsc::UnboundedSender<CrondResult<WatchEvent>>,
}

#[derive(Default)]
struct MemState {
    revision: i64,
    keys: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease_id: LeaseId,
    history: VecDeque<WatchEvent>,
    watchers: Vec<WatcherReg>,
}

impl MemState {
    fn emit(&mut self, event: WatchEvent) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        self.watchers
            .retain(|w| !event.key.starts_with(&w.prefix) || w.tx.send(Ok(event.clone())).is_ok());
    }

    fn apply_put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        self.revision += 1;
        // 键换租约时要先从旧租约上摘掉
        if let Some(old) = self.keys.get(key).and_then(|v| v.lease) {
            if let Some(record) = self.leases.get_mut(&old) {
                record.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(record) = self.leases.get_mut(&id) {
                record.keys.insert(key.to_string());
            }
        }
        self.keys.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                mod_revision: self.revision,
                lease,
            },
        );
        self.emit(WatchEvent {
            event_type: EventType::Put,
            key: key.to_string(),
            value: value.to_string(),
            revision: self.revision,
        });
    }

    fn apply_delete(&mut self, key: &str) -> bool {
        let Some(stored) = self.keys.remove(key) else {
            return false;
        };
        if let Some(id) = stored.lease {
            if let Some(record) = self.leases.get_mut(&id) {
                record.keys.remove(key);
            }
        }
        self.revision += 1;
        self.emit(WatchEvent {
            event_type: EventType::Delete,
            key: key.to_string(),
            value: String::new(),
            revision: self.revision,
        });
        true
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        let Some(record) = self.leases.remove(&lease) else {
            return;
        };
        for key in record.keys {
            self.apply_delete(&key);
        }
    }
}

pub struct MemoryCoordinator {
    state: Arc<Mutex<MemState>>,
}

impl MemoryCoordinator {
    /// 创建协调器并启动租约清扫任务；协调器全部句柄释放后清扫自动停止
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(MemState::default()));
        let weak: Weak<Mutex<MemState>> = Arc::downgrade(&state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_PERIOD).await;
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let mut st = state.lock().await;
                let now = Instant::now();
                let expired: Vec<LeaseId> = st
                    .leases
                    .iter()
                    .filter(|(_, r)| r.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    debug!("租约 {} 到期，释放其绑定键", id);
                    st.drop_lease(id);
                }
            }
        });
        Self { state }
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, key: &str) -> CrondResult<Option<KeyValue>> {
        let st = self.state.lock().await;
        Ok(st.keys.get(key).map(|v| KeyValue {
            key: key.to_string(),
            value: v.value.clone(),
            mod_revision: v.mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CrondResult<()> {
        let mut st = self.state.lock().await;
        if let Some(id) = lease {
            if !st.leases.contains_key(&id) {
                return Err(CrondError::coordinator(format!("租约 {id} 不存在或已过期")));
            }
        }
        st.apply_put(key, value, lease);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CrondResult<()> {
        let mut st = self.state.lock().await;
        st.apply_delete(key);
        Ok(())
    }

    async fn range(&self, prefix: &str) -> CrondResult<(Vec<KeyValue>, i64)> {
        let st = self.state.lock().await;
        let kvs = st
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                mod_revision: v.mod_revision,
            })
            .collect();
        Ok((kvs, st.revision))
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> CrondResult<WatchStream> {
        // 版本号从 1 起；0 与 1 等价，都表示「从头」
        let from_revision = from_revision.max(1);
        let mut st = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // 补投 [from_revision, revision] 区间内的事件
        if from_revision <= st.revision && st.revision > 0 {
            let oldest = st.history.front().map(|e| e.revision).unwrap_or(i64::MAX);
            if oldest > from_revision && from_revision <= st.revision - st.history.len() as i64 {
                return Err(CrondError::CompactedRevision);
            }
            for event in st.history.iter() {
                if event.revision >= from_revision && event.key.starts_with(prefix) {
                    let _ = tx.send(Ok(event.clone()));
                }
            }
        }

        st.watchers.push(WatcherReg {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(ChannelWatchStream::new(rx)))
    }

    async fn lease_grant(&self, ttl_seconds: i64) -> CrondResult<LeaseId> {
        let mut st = self.state.lock().await;
        st.next_lease_id += 1;
        let id = st.next_lease_id;
        let ttl = Duration::from_secs(ttl_seconds.max(1) as u64);
        st.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> CrondResult<()> {
        let mut st = self.state.lock().await;
        match st.leases.get_mut(&lease) {
            Some(record) => {
                record.deadline = Instant::now() + record.ttl;
                Ok(())
            }
            None => Err(CrondError::coordinator(format!(
                "租约 {lease} 不存在或已过期"
            ))),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> CrondResult<()> {
        let mut st = self.state.lock().await;
        st.drop_lease(lease);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> CrondResult<bool> {
        let mut st = self.state.lock().await;
        if st.keys.contains_key(key) {
            return Ok(false);
        }
        if let Some(id) = lease {
            if !st.leases.contains_key(&id) {
                return Err(CrondError::coordinator(format!("租约 {id} 不存在或已过期")));
            }
        }
        st.apply_put(key, value, lease);
        Ok(true)
    }

    async fn inc(&self, key: &str) -> CrondResult<i64> {
        let mut st = self.state.lock().await;
        let current = st
            .keys
            .get(key)
            .and_then(|v| v.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        st.apply_put(key, &next.to_string(), None);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::{sleep, timeout};

    async fn next_event(stream: &mut WatchStream) -> WatchEvent {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("等待事件超时")
            .expect("流意外结束")
            .expect("事件错误")
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let coord = MemoryCoordinator::new();
        assert!(coord.get("/a").await.unwrap().is_none());

        coord.put("/a", "1", None).await.unwrap();
        let kv = coord.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, "1");
        assert_eq!(kv.mod_revision, 1);

        coord.delete("/a").await.unwrap();
        assert!(coord.get("/a").await.unwrap().is_none());
        // 删除不存在的键不报错
        coord.delete("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_range_returns_revision() {
        let coord = MemoryCoordinator::new();
        coord.put("/t/1/a", "a", None).await.unwrap();
        coord.put("/t/1/b", "b", None).await.unwrap();
        coord.put("/t/2/c", "c", None).await.unwrap();

        let (kvs, revision) = coord.range("/t/1/").await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(revision, 3);
        assert_eq!(kvs[0].key, "/t/1/a");
        assert_eq!(kvs[1].key, "/t/1/b");
    }

    #[tokio::test]
    async fn test_watch_revision_order() {
        let coord = MemoryCoordinator::new();
        let mut stream = coord.watch("/t/", 1).await.unwrap();

        coord.put("/t/a", "1", None).await.unwrap();
        coord.put("/other", "x", None).await.unwrap();
        coord.put("/t/a", "2", None).await.unwrap();
        coord.delete("/t/a").await.unwrap();

        let e1 = next_event(&mut stream).await;
        let e2 = next_event(&mut stream).await;
        let e3 = next_event(&mut stream).await;
        assert_eq!(e1.event_type, EventType::Put);
        assert_eq!(e1.value, "1");
        assert_eq!(e2.value, "2");
        assert_eq!(e3.event_type, EventType::Delete);
        // 版本号严格递增，且不含无关前缀的事件
        assert!(e1.revision < e2.revision && e2.revision < e3.revision);
    }

    #[tokio::test]
    async fn test_watch_replays_history() {
        let coord = MemoryCoordinator::new();
        coord.put("/t/a", "1", None).await.unwrap();
        coord.put("/t/b", "2", None).await.unwrap();

        // 从版本 2 起订阅，应补投第二条事件
        let mut stream = coord.watch("/t/", 2).await.unwrap();
        let e = next_event(&mut stream).await;
        assert_eq!(e.key, "/t/b");
        assert_eq!(e.revision, 2);
    }

    #[tokio::test]
    async fn test_watch_from_future_revision() {
        let coord = MemoryCoordinator::new();
        coord.put("/t/a", "1", None).await.unwrap();

        let mut stream = coord.watch("/t/", 2).await.unwrap();
        coord.put("/t/b", "2", None).await.unwrap();
        let e = next_event(&mut stream).await;
        assert_eq!(e.key, "/t/b");
    }

    #[tokio::test]
    async fn test_watch_compacted_revision() {
        let coord = MemoryCoordinator::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            coord
                .put("/t/a", &i.to_string(), None)
                .await
                .unwrap();
        }
        let err = coord.watch("/t/", 1).await.unwrap_err();
        assert!(matches!(err, CrondError::CompactedRevision));
    }

    #[tokio::test]
    async fn test_lease_expiry_deletes_keys() {
        let coord = MemoryCoordinator::new();
        let lease = coord.lease_grant(1).await.unwrap();
        coord.put("/t/a", "1", Some(lease)).await.unwrap();

        let mut stream = coord.watch("/t/", 1).await.unwrap();
        // 吃掉补投的 PUT
        assert_eq!(next_event(&mut stream).await.event_type, EventType::Put);

        // 不续约，等待到期
        sleep(Duration::from_millis(1300)).await;
        assert!(coord.get("/t/a").await.unwrap().is_none());
        assert_eq!(next_event(&mut stream).await.event_type, EventType::Delete);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let coord = MemoryCoordinator::new();
        let lease = coord.lease_grant(1).await.unwrap();
        coord.put("/t/a", "1", Some(lease)).await.unwrap();

        for _ in 0..4 {
            sleep(Duration::from_millis(400)).await;
            coord.lease_keep_alive(lease).await.unwrap();
        }
        assert!(coord.get("/t/a").await.unwrap().is_some());

        coord.lease_revoke(lease).await.unwrap();
        assert!(coord.get("/t/a").await.unwrap().is_none());
        // 吊销幂等
        coord.lease_revoke(lease).await.unwrap();
        // 已吊销的租约不能再续约
        assert!(coord.lease_keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let coord = MemoryCoordinator::new();
        assert!(coord.put_if_absent("/l/a", "me", None).await.unwrap());
        assert!(!coord.put_if_absent("/l/a", "you", None).await.unwrap());
        assert_eq!(coord.get("/l/a").await.unwrap().unwrap().value, "me");
    }

    #[tokio::test]
    async fn test_inc_monotonic() {
        let coord = MemoryCoordinator::new();
        assert_eq!(coord.inc("/counter").await.unwrap(), 1);
        assert_eq!(coord.inc("/counter").await.unwrap(), 2);
        assert_eq!(coord.inc("/counter").await.unwrap(), 3);
    }
}
