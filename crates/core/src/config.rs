use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{CrondError, CrondResult};

/// 应用配置，server 与 agent 共用一份文件
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// agent 配置 report_addr 后可省略
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// memory | etcd
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// 本 agent 服务的项目列表
    #[serde(default)]
    pub projects: Vec<i64>,
    /// 结果上报地址，空则直写数据库
    #[serde(default)]
    pub report_addr: String,
    #[serde(default = "default_grace")]
    pub grace_seconds: u64,
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_backend() -> String {
    "memory".to_string()
}
fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}
fn default_prefix() -> String {
    "/crond".to_string()
}
fn default_lease_ttl() -> i64 {
    5
}
fn default_grace() -> u64 {
    5
}
fn default_output_limit() -> usize {
    1024 * 1024
}
fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_connect_timeout() -> u64 {
    30
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: default_endpoints(),
            prefix: default_prefix(),
            lease_ttl_seconds: default_lease_ttl(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            report_addr: String::new(),
            grace_seconds: default_grace(),
            output_limit_bytes: default_output_limit(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind(),
        }
    }
}

impl AppConfig {
    /// 加载配置：TOML 文件 + `CROND_` 前缀环境变量覆盖
    pub fn load(config_path: Option<&str>) -> CrondResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(CrondError::Configuration(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for path in ["config/crond.toml", "crond.toml", "/etc/crond/config.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CROND")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| CrondError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| CrondError::Configuration(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> CrondResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| CrondError::Configuration(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CrondResult<()> {
        match self.coordinator.backend.as_str() {
            "memory" | "etcd" => {}
            other => {
                return Err(CrondError::Configuration(format!(
                    "不支持的协调器后端: {other}"
                )))
            }
        }
        if self.coordinator.backend == "etcd" && self.coordinator.endpoints.is_empty() {
            return Err(CrondError::Configuration(
                "etcd 后端需要至少一个 endpoint".to_string(),
            ));
        }
        if self.coordinator.lease_ttl_seconds < 2 {
            return Err(CrondError::Configuration(
                "lease_ttl_seconds 不能小于 2".to_string(),
            ));
        }
        if self.agent.report_addr.is_empty() && self.database.is_none() && !self.agent.projects.is_empty() {
            return Err(CrondError::Configuration(
                "agent 未配置 report_addr 时必须配置 [database]".to_string(),
            ));
        }
        Ok(())
    }
}
