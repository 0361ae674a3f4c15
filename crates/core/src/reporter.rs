use async_trait::async_trait;

use crate::errors::CrondResult;
use crate::models::TaskExecuteResult;

/// 执行结果上报出口
///
/// 两种实现：HTTP 上报到控制面收集接口，或直接写入 task_log 表。
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn result_report(&self, result: &TaskExecuteResult) -> CrondResult<()>;
}
