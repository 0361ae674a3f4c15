//! 任务调度器（agent 侧核心）
//!
//! 单一驱动任务独占计划表：watcher 的变更事件、执行完成回执与
//! 1 秒时钟在同一个 `select!` 循环里串行合并，计划表不需要锁。
//! 到点任务先抢分布式锁，抢到才真正执行；执行本身在独立任务里
//! 并行进行，与计划表仅通过 in-flight 句柄联系。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crond_core::models::TaskInfo;
use crond_core::{CrondError, KeyMaker, TaskReporter, Warner, WarningData};
use crond_coordination::{Coordinator, TaskLock, TaskPublisher};

use crate::event::TaskEvent;
use crate::executor::{self, CancelHandle, RunContext};
use crate::reporter::report_with_retry;

type TaskKey = (i64, String);

/// 调度器运行所需的外部依赖
pub struct SchedulerDeps {
    pub coordinator: Arc<dyn Coordinator>,
    pub keys: KeyMaker,
    pub publisher: Arc<TaskPublisher>,
    pub reporter: Arc<dyn TaskReporter>,
    pub warner: Arc<dyn Warner>,
    pub agent_ip: String,
    pub lock_ttl_seconds: i64,
    pub grace: Duration,
    pub output_limit_bytes: usize,
}

struct PlanEntry {
    task: TaskInfo,
    schedule: Schedule,
    next_fire_at: DateTime<Utc>,
}

struct RunHandle {
    cancel: CancelHandle,
}

pub struct TaskScheduler {
    deps: Arc<SchedulerDeps>,
    plan: HashMap<TaskKey, PlanEntry>,
    in_flight: HashMap<TaskKey, RunHandle>,
    events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    done_tx: mpsc::UnboundedSender<TaskKey>,
    done_rx: mpsc::UnboundedReceiver<TaskKey>,
}

impl TaskScheduler {
    /// 返回 (事件发送端, 调度器)；发送端交给 watcher
    pub fn new(deps: SchedulerDeps) -> (mpsc::UnboundedSender<TaskEvent>, Self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        (
            events_tx,
            Self {
                deps: Arc::new(deps),
                plan: HashMap::new(),
                in_flight: HashMap::new(),
                events_rx,
                done_tx,
                done_rx,
            },
        )
    }

    /// 调度主循环，直到关闭信号到来
    ///
    /// 睡到计划表里最早的触发点再醒来，各节点因此在同一个 cron
    /// 边界上几乎同时抢锁，输家在下个边界前不会再尝试。
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("调度器启动");
        loop {
            let sleep_duration = match self.plan.values().map(|e| e.next_fire_at).min() {
                Some(at) => (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                // 计划为空时保持秒级轮询
                None => Duration::from_secs(1),
            };
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.apply_event(event),
                        // watcher 全部退出，仅剩时钟驱动
                        None => tokio::time::sleep(Duration::from_secs(1)).await,
                    }
                }
                Some(key) = self.done_rx.recv() => {
                    self.in_flight.remove(&key);
                }
                _ = tokio::time::sleep(sleep_duration) => self.tick(),
                _ = shutdown_rx.recv() => {
                    info!("调度器收到关闭信号，当前 {} 个任务执行中", self.in_flight.len());
                    return;
                }
            }
        }
    }

    fn apply_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Upsert(task) => self.upsert(task),
            TaskEvent::Remove {
                project_id,
                task_id,
            } => {
                // 计划表里摘掉即可；执行中的那次照常跑完，结束后不再续排
                if self.plan.remove(&(project_id, task_id.clone())).is_some() {
                    info!("任务已移出计划: {}/{}", project_id, task_id);
                }
            }
            TaskEvent::Kill {
                project_id,
                task_id,
            } => {
                if let Some(handle) = self.in_flight.get(&(project_id, task_id.clone())) {
                    info!("收到杀死信号，取消执行: {}/{}", project_id, task_id);
                    handle.cancel.cancel();
                } else {
                    debug!("杀死信号无目标(未在本节点执行): {}/{}", project_id, task_id);
                }
            }
            TaskEvent::TempRun(task) => {
                let key = task.key();
                if self.in_flight.contains_key(&key) {
                    info!("临时调度被跳过，任务执行中: {}/{}", key.0, key.1);
                    return;
                }
                info!("临时调度: {}/{}", key.0, key.1);
                self.spawn_run(key, task);
            }
        }
    }

    fn upsert(&mut self, task: TaskInfo) {
        let schedule = match Schedule::from_str(&task.cron_expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                // 发布侧已做校验，到这里说明绕过了控制面，不装入计划
                warn!(
                    "任务 {}/{} cron 表达式非法，忽略: {}",
                    task.project_id, task.task_id, e
                );
                return;
            }
        };
        // 取严格未来的下一个匹配点
        let Some(next_fire_at) = schedule.after(&Utc::now()).next() else {
            warn!(
                "任务 {}/{} 的 cron 不会再触发，忽略",
                task.project_id, task.task_id
            );
            return;
        };

        let key = task.key();
        debug!(
            "计划更新: {}/{} 下次触发 {}",
            key.0, key.1, next_fire_at
        );
        // 覆盖旧条目；执行中的一次运行不受影响
        self.plan.insert(
            key,
            PlanEntry {
                task,
                schedule,
                next_fire_at,
            },
        );
    }

    /// 时钟推进：触发所有到点且未在执行中的任务
    fn tick(&mut self) {
        let now = Utc::now();
        let mut due: Vec<(TaskKey, TaskInfo)> = Vec::new();

        for (key, entry) in self.plan.iter_mut() {
            if entry.next_fire_at > now {
                continue;
            }
            // 无论本次是否真正执行，都从 now 推进到下一个严格未来的匹配点
            match entry.schedule.after(&now).next() {
                Some(next) => entry.next_fire_at = next,
                None => {
                    warn!("任务 {}/{} 的 cron 不会再触发", key.0, key.1);
                    entry.next_fire_at = DateTime::<Utc>::MAX_UTC;
                    continue;
                }
            }

            if self.in_flight.contains_key(key) {
                info!("任务 {}/{} 上次执行未结束，跳过本次触发", key.0, key.1);
                continue;
            }
            due.push((key.clone(), entry.task.clone()));
        }

        for (key, task) in due {
            self.spawn_run(key, task);
        }
    }

    fn spawn_run(&mut self, key: TaskKey, task: TaskInfo) {
        let cancel = CancelHandle::new();
        self.in_flight.insert(
            key.clone(),
            RunHandle {
                cancel: cancel.clone(),
            },
        );
        let deps = Arc::clone(&self.deps);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            run_once(deps, task, cancel).await;
            let _ = done_tx.send(key);
        });
    }
}

/// 一次触发的完整生命周期：抢锁 → 置位运行标记 → 子进程 → 上报 →
/// 清除标记 → 放锁。锁没抢到（他人胜出）是正常结束。
async fn run_once(deps: Arc<SchedulerDeps>, task: TaskInfo, cancel: CancelHandle) {
    let mut lock = TaskLock::new(
        Arc::clone(&deps.coordinator),
        &deps.keys,
        task.project_id,
        &task.task_id,
        &deps.agent_ip,
        deps.lock_ttl_seconds,
    );

    match lock.try_lock().await {
        Ok(()) => {}
        Err(CrondError::AlreadyLocked) => {
            debug!(
                "任务 {}/{} 的锁被其他节点持有，本次让出",
                task.project_id, task.task_id
            );
            return;
        }
        Err(e) => {
            warn!(
                "任务 {}/{} 抢锁失败: {}",
                task.project_id, task.task_id, e
            );
            let report = deps
                .warner
                .warning(WarningData::task(
                    format!(
                        "任务 {}/{} 抢锁失败: {e}",
                        task.project_id, task.task_id
                    ),
                    deps.agent_ip.clone(),
                ))
                .await;
            if let Err(warn_err) = report {
                warn!("抢锁失败告警上报失败: {}", warn_err);
            }
            return;
        }
    }

    if let Err(e) = deps
        .publisher
        .set_task_running(task.project_id, &task.task_id, true)
        .await
    {
        warn!("置位运行标记失败: {}", e);
    }

    let ctx = RunContext {
        client_ip: deps.agent_ip.clone(),
        output_limit_bytes: deps.output_limit_bytes,
        grace: deps.grace,
        cancel,
    };
    let result = executor::execute(&task, &ctx).await;
    info!(
        "任务 {}/{} 执行结束, 耗时 {}s, 出错: {}",
        task.project_id,
        task.task_id,
        result.end_time - result.start_time,
        result.with_error()
    );

    report_with_retry(&deps.reporter, &deps.warner, &deps.agent_ip, &result).await;

    if let Err(e) = deps
        .publisher
        .set_task_running(task.project_id, &task.task_id, false)
        .await
    {
        warn!("清除运行标记失败: {}", e);
    }
    if let Err(e) = lock.unlock().await {
        warn!("释放任务锁失败: {}", e);
    }
}
