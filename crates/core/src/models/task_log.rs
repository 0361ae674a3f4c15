use serde::{Deserialize, Serialize};

use super::task::TaskExecuteResult;

/// 任务执行日志，只追加；保留 7 天后由清理任务删除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    #[serde(default)]
    pub id: i64,
    pub project_id: i64,
    pub task_id: String,
    pub name: String,
    pub result: String,
    /// unix 秒
    pub start_time: i64,
    pub end_time: i64,
    pub command: String,
    /// 0 正常结束 1 出错
    pub with_error: i8,
    pub client_ip: String,
}

impl From<&TaskExecuteResult> for TaskLog {
    fn from(res: &TaskExecuteResult) -> Self {
        let result = match &res.error {
            Some(err) => format!("{}\n{}", err, res.output),
            None => res.output.clone(),
        };
        Self {
            id: 0,
            project_id: res.project_id,
            task_id: res.task_id.clone(),
            name: res.name.clone(),
            result,
            start_time: res.start_time,
            end_time: res.end_time,
            command: res.command.clone(),
            with_error: if res.with_error() { 1 } else { 0 },
            client_ip: res.client_ip.clone(),
        }
    }
}
