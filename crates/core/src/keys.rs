//! 协调器键空间与载荷编码
//!
//! 所有协调器键都由本模块拼装，其他组件不得自行拼接键字符串。
//! 键结构：`{prefix}/{kind}/{project_id}/{suffix}`。

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{CrondError, CrondResult};
use crate::models::TaskInfo;

pub const CLUSTER_AUTO_INDEX: &str = "cluster_auto_index";

/// 键构造器，持有配置的键前缀
#[derive(Debug, Clone)]
pub struct KeyMaker {
    prefix: String,
}

impl KeyMaker {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task_key(&self, project_id: i64, task_id: &str) -> String {
        format!("{}/tasks/{}/{}", self.prefix, project_id, task_id)
    }

    pub fn task_prefix(&self, project_id: i64) -> String {
        format!("{}/tasks/{}/", self.prefix, project_id)
    }

    pub fn killer_key(&self, project_id: i64, task_id: &str) -> String {
        format!("{}/killer/{}/{}", self.prefix, project_id, task_id)
    }

    pub fn killer_prefix(&self, project_id: i64) -> String {
        format!("{}/killer/{}/", self.prefix, project_id)
    }

    pub fn temp_key(&self, project_id: i64, task_id: &str) -> String {
        format!("{}/temp/{}/{}", self.prefix, project_id, task_id)
    }

    pub fn temp_prefix(&self, project_id: i64) -> String {
        format!("{}/temp/{}/", self.prefix, project_id)
    }

    pub fn lock_key(&self, project_id: i64, task_id: &str) -> String {
        format!("{}/lock/{}/{}", self.prefix, project_id, task_id)
    }

    pub fn register_key(&self, project_id: i64, ip: &str) -> String {
        format!("{}/agents/{}/{}", self.prefix, project_id, ip)
    }

    pub fn register_prefix(&self, project_id: i64) -> String {
        format!("{}/agents/{}/", self.prefix, project_id)
    }

    pub fn cluster_auto_index_key(&self) -> String {
        format!("{}/{}", self.prefix, CLUSTER_AUTO_INDEX)
    }

    /// 从 `{prefix}/{kind}/{pid}/{suffix}` 形式的键中取出 (project_id, suffix)
    ///
    /// killer/temp/tasks/lock/agents 的键都满足该形状。
    pub fn split_project_key<'a>(&self, kind: &str, key: &'a str) -> Option<(i64, &'a str)> {
        let head = format!("{}/{}/", self.prefix, kind);
        let rest = key.strip_prefix(head.as_str())?;
        let (pid, suffix) = rest.split_once('/')?;
        let project_id = pid.parse::<i64>().ok()?;
        if suffix.is_empty() {
            return None;
        }
        Some((project_id, suffix))
    }
}

/// 载荷编码，协调器里的所有值都是字段命名的 JSON
pub fn encode<T: Serialize>(value: &T) -> CrondResult<String> {
    serde_json::to_string(value).map_err(|e| CrondError::MalformedPayload(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> CrondResult<T> {
    serde_json::from_str(raw).map_err(|e| CrondError::MalformedPayload(e.to_string()))
}

pub fn decode_task(raw: &str) -> CrondResult<TaskInfo> {
    decode(raw)
}
