use serde::{Deserialize, Serialize};

/// 项目，任务的归属单位
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub remark: String,
    /// 项目拥有者
    pub uid: i64,
}

/// 用户与项目的多对多关联
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRelevance {
    pub project_id: i64,
    pub uid: i64,
    /// unix 秒
    pub create_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub account: String,
    pub name: String,
    /// 口令散列，token 签发不在本仓库范围内
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub permission: String,
    pub create_time: i64,
}
