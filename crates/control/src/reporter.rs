use std::sync::Arc;

use async_trait::async_trait;

use crond_core::models::{TaskExecuteResult, TaskLog};
use crond_core::{CrondResult, TaskReporter};

use crate::store::TaskLogStore;

/// 直写存储的上报实现
///
/// agent 未配置 report_addr 时使用：执行结果不经 HTTP，
/// 直接插入 task_log 表。
pub struct DbTaskReporter {
    task_log: Arc<dyn TaskLogStore>,
}

impl DbTaskReporter {
    pub fn new(task_log: Arc<dyn TaskLogStore>) -> Self {
        Self { task_log }
    }
}

#[async_trait]
impl TaskReporter for DbTaskReporter {
    async fn result_report(&self, result: &TaskExecuteResult) -> CrondResult<()> {
        self.task_log.create(None, &TaskLog::from(result)).await
    }
}
