use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::CrondResult;

/// 告警类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    System,
    Task,
}

/// 运维告警内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningData {
    pub data: String,
    #[serde(rename = "type")]
    pub warning_type: WarningType,
    pub agent_ip: String,
}

impl WarningData {
    pub fn system(data: impl Into<String>, agent_ip: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            warning_type: WarningType::System,
            agent_ip: agent_ip.into(),
        }
    }

    pub fn task(data: impl Into<String>, agent_ip: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            warning_type: WarningType::Task,
            agent_ip: agent_ip.into(),
        }
    }
}

/// 唯一的告警出口，所有运维异常都走这里
#[async_trait]
pub trait Warner: Send + Sync {
    async fn warning(&self, data: WarningData) -> CrondResult<()>;
}

/// 默认实现：落到结构化日志
pub struct LogWarner;

#[async_trait]
impl Warner for LogWarner {
    async fn warning(&self, data: WarningData) -> CrondResult<()> {
        warn!(
            warning_type = ?data.warning_type,
            agent_ip = %data.agent_ip,
            "{}",
            data.data
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_warner_accepts_all() {
        let warner = LogWarner;
        warner
            .warning(WarningData::system("coordinator down", "127.0.0.1"))
            .await
            .unwrap();
        warner
            .warning(WarningData::task("task failed", "127.0.0.1"))
            .await
            .unwrap();
    }

    #[test]
    fn test_warning_type_serialized_name() {
        let data = WarningData::system("x", "ip");
        let raw = serde_json::to_string(&data).unwrap();
        assert!(raw.contains(r#""type":"system""#));
    }
}
