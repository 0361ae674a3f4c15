//! agent 注册与发现
//!
//! agent 启动时先通过集群自增计数器取得 worker 序号（作为雪花 ID
//! 的节点位），再在一个注册租约下为其服务的每个项目写入
//! `agents/{project}/{ip}` 键；租约到期等价于注销。

use std::sync::Arc;

use tracing::info;

use crond_core::{CrondResult, KeyMaker};

use crate::kv::{Coordinator, LeaseKeeper};

pub struct AgentRegister {
    coordinator: Arc<dyn Coordinator>,
    keys: KeyMaker,
    agent_ip: String,
    ttl_seconds: i64,
    keeper: Option<LeaseKeeper>,
}

impl AgentRegister {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keys: KeyMaker,
        agent_ip: &str,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            coordinator,
            keys,
            agent_ip: agent_ip.to_string(),
            ttl_seconds,
            keeper: None,
        }
    }

    /// 从集群自增计数器取得本节点的 worker 序号
    pub async fn bootstrap_worker_id(&self) -> CrondResult<i64> {
        self.coordinator
            .inc(&self.keys.cluster_auto_index_key())
            .await
    }

    /// 注册本 agent 服务的所有项目，单个租约覆盖全部注册键
    pub async fn register(&mut self, projects: &[i64]) -> CrondResult<()> {
        let lease = self.coordinator.lease_grant(self.ttl_seconds).await?;
        for project_id in projects {
            self.coordinator
                .put(
                    &self.keys.register_key(*project_id, &self.agent_ip),
                    &self.agent_ip,
                    Some(lease),
                )
                .await?;
        }
        self.keeper = Some(LeaseKeeper::spawn(
            Arc::clone(&self.coordinator),
            lease,
            self.ttl_seconds,
        ));
        info!(
            "agent {} 已注册到 {} 个项目",
            self.agent_ip,
            projects.len()
        );
        Ok(())
    }

    /// 干净下线：吊销注册租约。幂等。
    pub async fn deregister(&mut self) -> CrondResult<()> {
        if let Some(keeper) = self.keeper.take() {
            self.coordinator.lease_revoke(keeper.lease()).await?;
            info!("agent {} 已注销", self.agent_ip);
        }
        Ok(())
    }
}

/// 项目下存活 agent 的 IP 列表
pub async fn get_worker_list(
    coordinator: &Arc<dyn Coordinator>,
    keys: &KeyMaker,
    project_id: i64,
) -> CrondResult<Vec<String>> {
    let (kvs, _) = coordinator.range(&keys.register_prefix(project_id)).await?;
    Ok(kvs
        .iter()
        .filter_map(|kv| {
            keys.split_project_key("agents", &kv.key)
                .map(|(_, ip)| ip.to_string())
        })
        .collect())
}
