//! 关系存储门面
//!
//! 四张表各有一个仓库 trait，查询条件一律走选择器；
//! Create*/Delete*/Clean 类操作接受可选的显式事务句柄，
//! 事务由门面的 `begin_tx` 开启。

pub mod project_repository;
pub mod task_log_repository;
pub mod user_repository;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

use crond_core::config::DatabaseConfig;
use crond_core::models::{Project, ProjectRelevance, TaskLog, User};
use crond_core::{CrondError, CrondResult};

use crate::selector::Selector;

pub use project_repository::{MySqlProjectStore, MySqlRelevanceStore};
pub use task_log_repository::MySqlTaskLogStore;
pub use user_repository::MySqlUserStore;

pub type Tx = sqlx::Transaction<'static, sqlx::MySql>;

pub(crate) fn db_err(e: sqlx::Error) -> CrondError {
    match e {
        sqlx::Error::RowNotFound => CrondError::RecordNotFound,
        e => CrondError::internal("数据库操作失败", e),
    }
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, project: &Project) -> CrondResult<i64>;
    async fn get_projects(&self, selector: &Selector) -> CrondResult<Vec<Project>>;
    async fn update(&self, project_id: i64, title: &str, remark: &str) -> CrondResult<()>;
    async fn delete(&self, tx: Option<&mut Tx>, selector: &Selector) -> CrondResult<()>;
}

#[async_trait]
pub trait RelevanceStore: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, relevance: &ProjectRelevance) -> CrondResult<()>;
    async fn delete(&self, tx: Option<&mut Tx>, project_id: i64, uid: i64) -> CrondResult<()>;
    async fn get_list(&self, selector: &Selector) -> CrondResult<Vec<ProjectRelevance>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, user: &User) -> CrondResult<()>;
    async fn get_users(&self, selector: &Selector) -> CrondResult<Vec<User>>;
    async fn get_total(&self, selector: &Selector) -> CrondResult<i64>;
    async fn change_password(&self, uid: i64, password: &str, salt: &str) -> CrondResult<()>;
}

#[async_trait]
pub trait TaskLogStore: Send + Sync {
    async fn create(&self, tx: Option<&mut Tx>, log: &TaskLog) -> CrondResult<()>;
    async fn get_list(&self, selector: &Selector) -> CrondResult<Vec<TaskLog>>;
    async fn get_total(&self, selector: &Selector) -> CrondResult<i64>;
    async fn clean(&self, tx: Option<&mut Tx>, selector: &Selector) -> CrondResult<()>;
}

pub struct SqlStore {
    pool: MySqlPool,
    project: MySqlProjectStore,
    relevance: MySqlRelevanceStore,
    user: MySqlUserStore,
    task_log: MySqlTaskLogStore,
}

impl SqlStore {
    pub async fn connect(config: &DatabaseConfig) -> CrondResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| CrondError::internal("连接数据库失败", e))?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: MySqlPool) -> Self {
        Self {
            project: MySqlProjectStore::new(pool.clone()),
            relevance: MySqlRelevanceStore::new(pool.clone()),
            user: MySqlUserStore::new(pool.clone()),
            task_log: MySqlTaskLogStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn begin_tx(&self) -> CrondResult<Tx> {
        self.pool.begin().await.map_err(db_err)
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub fn project(&self) -> &MySqlProjectStore {
        &self.project
    }

    pub fn relevance(&self) -> &MySqlRelevanceStore {
        &self.relevance
    }

    pub fn user(&self) -> &MySqlUserStore {
        &self.user
    }

    pub fn task_log(&self) -> &MySqlTaskLogStore {
        &self.task_log
    }
}
