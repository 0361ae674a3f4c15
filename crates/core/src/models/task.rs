use serde::{Deserialize, Serialize};

/// 任务定义
///
/// 控制面是持久字段的唯一写入方；`is_running` 由执行任务的 agent
/// 置位/清除，仅作为运行状态的展示，权威状态以锁键是否存在为准。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub project_id: i64,
    /// 项目内唯一，调度器视其为不透明字符串
    pub task_id: String,
    pub name: String,
    pub command: String,
    /// 6 字段秒级 cron 表达式
    pub cron_expr: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub is_running: bool,
    /// 预留字段，暂无调度语义
    #[serde(default)]
    pub noseize: bool,
}

impl TaskInfo {
    /// 调度计划中的唯一键
    pub fn key(&self) -> (i64, String) {
        (self.project_id, self.task_id.clone())
    }
}

/// 一次任务执行的结果，由 agent 上报给 reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecuteResult {
    pub project_id: i64,
    pub task_id: String,
    pub name: String,
    pub command: String,
    /// unix 秒
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub exit_status: Option<i32>,
    /// stdout+stderr 合并输出，超限截断
    pub output: String,
    /// 正常结束为 None；"timeout" / "killed" / 其他失败原因
    #[serde(default)]
    pub error: Option<String>,
    pub client_ip: String,
}

impl TaskExecuteResult {
    pub fn with_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_info_additive_decode() {
        // 旧版本写入的载荷缺少新增字段，解码必须成功并取默认值
        let raw = r#"{"project_id":1,"task_id":"a","name":"demo","command":"echo hi","cron_expr":"*/2 * * * * *"}"#;
        let task: TaskInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(task.timeout_seconds, 0);
        assert!(!task.is_running);
        assert!(!task.noseize);
    }

    #[test]
    fn test_result_error_flag() {
        let mut result = TaskExecuteResult {
            project_id: 1,
            task_id: "a".to_string(),
            name: "demo".to_string(),
            command: "echo hi".to_string(),
            start_time: 100,
            end_time: 101,
            exit_status: Some(0),
            output: "hi\n".to_string(),
            error: None,
            client_ip: "127.0.0.1".to_string(),
        };
        assert!(!result.with_error());
        result.error = Some("timeout".to_string());
        assert!(result.with_error());
    }
}
