use crond_core::models::TaskInfo;

/// watcher 投递给调度器的事件
///
/// 单向消息通道保证计划变更按协调器版本号顺序落到调度器上。
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// 新增或更新任务定义
    Upsert(TaskInfo),
    /// 任务定义被删除；不打断正在执行的一次运行
    Remove { project_id: i64, task_id: String },
    /// 杀死信号：取消本节点上正在执行的子进程
    Kill { project_id: i64, task_id: String },
    /// 绕过 cron 计划立即执行一次
    TempRun(TaskInfo),
}
