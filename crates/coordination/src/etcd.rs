//! etcd 协调器后端
//!
//! 把能力契约映射到 etcd v3 API。etcd 客户端句柄可廉价克隆，
//! 每次调用克隆一份以满足 `&mut self` 的方法签名。

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType as EtcdEventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::mpsc;
use tracing::warn;

use crond_core::{CrondError, CrondResult};

use crate::kv::{
    ChannelWatchStream, Coordinator, EventType, KeyValue, LeaseId, WatchEvent, WatchStream,
};

fn map_err(err: etcd_client::Error) -> CrondError {
    CrondError::coordinator(err)
}

pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    pub async fn connect(endpoints: &[String]) -> CrondResult<Self> {
        let client = Client::connect(endpoints, None).await.map_err(map_err)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> CrondResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(map_err)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        Ok(Some(KeyValue {
            key: kv.key_str().map_err(map_err)?.to_string(),
            value: kv.value_str().map_err(map_err)?.to_string(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> CrondResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await.map_err(map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CrondResult<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(map_err)?;
        Ok(())
    }

    async fn range(&self, prefix: &str) -> CrondResult<(Vec<KeyValue>, i64)> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            kvs.push(KeyValue {
                key: kv.key_str().map_err(map_err)?.to_string(),
                value: kv.value_str().map_err(map_err)?.to_string(),
                mod_revision: kv.mod_revision(),
            });
        }
        Ok((kvs, revision))
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> CrondResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (_watcher, mut etcd_stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(map_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // watcher 句柄随任务存活，任务退出即取消服务端 watch
            let _watcher = _watcher;
            loop {
                match etcd_stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.compact_revision() > 0 {
                            let _ = tx.send(Err(CrondError::CompactedRevision));
                            return;
                        }
                        if resp.canceled() {
                            let _ = tx.send(Err(CrondError::coordinator("watch 已被服务端取消")));
                            return;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let mapped = WatchEvent {
                                event_type: match event.event_type() {
                                    EtcdEventType::Put => EventType::Put,
                                    EtcdEventType::Delete => EventType::Delete,
                                },
                                key: match kv.key_str() {
                                    Ok(k) => k.to_string(),
                                    Err(e) => {
                                        warn!("watch 事件键非法: {}", e);
                                        continue;
                                    }
                                },
                                value: kv.value_str().unwrap_or_default().to_string(),
                                revision: kv.mod_revision(),
                            };
                            if tx.send(Ok(mapped)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(map_err(e)));
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ChannelWatchStream::new(rx)))
    }

    async fn lease_grant(&self, ttl_seconds: i64) -> CrondResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_seconds, None)
            .await
            .map_err(map_err)?;
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> CrondResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) =
            client.lease_keep_alive(lease).await.map_err(map_err)?;
        keeper.keep_alive().await.map_err(map_err)?;
        match responses.message().await.map_err(map_err)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(CrondError::coordinator(format!(
                "租约 {lease} 不存在或已过期"
            ))),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> CrondResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            // 已失效的租约视为吊销成功
            Err(etcd_client::Error::GRpcStatus(status))
                if status.message().contains("lease not found") =>
            {
                Ok(())
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> CrondResult<bool> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, options)]);
        let resp = client.txn(txn).await.map_err(map_err)?;
        Ok(resp.succeeded())
    }

    async fn inc(&self, key: &str) -> CrondResult<i64> {
        let mut client = self.client.clone();
        loop {
            let resp = client.get(key, None).await.map_err(map_err)?;
            let (current, mod_revision) = match resp.kvs().first() {
                Some(kv) => (
                    kv.value_str()
                        .ok()
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(0),
                    kv.mod_revision(),
                ),
                None => (0, 0),
            };
            let next = current + 1;
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key,
                    CompareOp::Equal,
                    mod_revision,
                )])
                .and_then(vec![TxnOp::put(key, next.to_string(), None)]);
            let resp = client.txn(txn).await.map_err(map_err)?;
            if resp.succeeded() {
                return Ok(next);
            }
            // 并发竞争，重读后重试
        }
    }
}
