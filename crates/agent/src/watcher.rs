//! 任务流监听（agent 侧）
//!
//! 启动时对每个项目做全量快照并记下版本号，随后从「最大版本号 + 1」
//! 起监听 tasks/killer/temp 三路前缀，把变更按版本号顺序转成事件
//! 投给调度器。传输中断按指数退避重连并从断点续传；断点已被压缩
//! 时回退到全量快照。

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crond_core::keys::decode_task;
use crond_core::{CrondError, CrondResult, KeyMaker, Warner, WarningData};
use crond_coordination::{Coordinator, EventType, TaskPublisher, WatchEvent, WatchStream};

use crate::event::TaskEvent;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct TaskWatcher {
    coordinator: Arc<dyn Coordinator>,
    keys: KeyMaker,
    publisher: Arc<TaskPublisher>,
    warner: Arc<dyn Warner>,
    agent_ip: String,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskWatcher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keys: KeyMaker,
        publisher: Arc<TaskPublisher>,
        warner: Arc<dyn Warner>,
        agent_ip: &str,
        events_tx: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        Self {
            coordinator,
            keys,
            publisher,
            warner,
            agent_ip: agent_ip.to_string(),
            events_tx,
        }
    }

    /// 单个项目的监听主循环；预期在监督器下长期运行
    pub async fn run_project(&self, project_id: i64) {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        'snapshot: loop {
            let revision = match self.snapshot(project_id).await {
                Ok(revision) => {
                    backoff = RECONNECT_BACKOFF_INITIAL;
                    revision
                }
                Err(e) => {
                    warn!("项目 {} 快照失败: {}, {:?} 后重试", project_id, e, backoff);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    continue 'snapshot;
                }
            };
            let mut next_revision = revision + 1;

            'watch: loop {
                let streams = self.open_watches(project_id, next_revision).await;
                let (mut tasks, mut killer, mut temp) = match streams {
                    Ok(streams) => {
                        backoff = RECONNECT_BACKOFF_INITIAL;
                        streams
                    }
                    Err(CrondError::CompactedRevision) => {
                        info!("项目 {} 断点已被压缩，回退全量快照", project_id);
                        continue 'snapshot;
                    }
                    Err(e) => {
                        warn!(
                            "项目 {} 建立监听失败: {}, {:?} 后重试",
                            project_id, e, backoff
                        );
                        sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                        continue 'watch;
                    }
                };
                info!("项目 {} 监听已建立，起始版本 {}", project_id, next_revision);

                loop {
                    let item = tokio::select! {
                        item = tasks.next() => item.map(|i| (WatchKind::Task, i)),
                        item = killer.next() => item.map(|i| (WatchKind::Killer, i)),
                        item = temp.next() => item.map(|i| (WatchKind::Temp, i)),
                    };
                    match item {
                        Some((kind, Ok(event))) => {
                            next_revision = next_revision.max(event.revision + 1);
                            self.route(project_id, kind, event).await;
                        }
                        Some((_, Err(CrondError::CompactedRevision))) => {
                            info!("项目 {} 监听被压缩打断，回退全量快照", project_id);
                            continue 'snapshot;
                        }
                        Some((kind, Err(e))) => {
                            warn!(
                                "项目 {} 的 {:?} 监听出错: {}, {:?} 后从版本 {} 续传",
                                project_id, kind, e, backoff, next_revision
                            );
                            sleep(backoff).await;
                            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                            continue 'watch;
                        }
                        None => {
                            warn!(
                                "项目 {} 监听流关闭, {:?} 后从版本 {} 续传",
                                project_id, backoff, next_revision
                            );
                            sleep(backoff).await;
                            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                            continue 'watch;
                        }
                    }
                }
            }
        }
    }

    /// 全量快照：把当前任务集以 Upsert 投给调度器，返回快照版本号
    ///
    /// 期间发现 `is_running=true` 但锁键缺失的任务（持有方崩溃残留），
    /// 顺手清除其运行标记。
    pub async fn snapshot(&self, project_id: i64) -> CrondResult<i64> {
        let (kvs, revision) = self
            .coordinator
            .range(&self.keys.task_prefix(project_id))
            .await?;
        info!("项目 {} 快照: {} 个任务, 版本 {}", project_id, kvs.len(), revision);

        for kv in kvs {
            let mut task = match decode_task(&kv.value) {
                Ok(task) => task,
                Err(e) => {
                    self.alert_malformed(&kv.key, &e).await;
                    continue;
                }
            };
            if task.is_running {
                let lock_key = self.keys.lock_key(task.project_id, &task.task_id);
                if self.coordinator.get(&lock_key).await?.is_none() {
                    info!(
                        "任务 {}/{} 运行标记残留(无锁持有)，清除",
                        task.project_id, task.task_id
                    );
                    task.is_running = false;
                    if let Err(e) = self
                        .publisher
                        .set_task_running(task.project_id, &task.task_id, false)
                        .await
                    {
                        warn!("清除残留运行标记失败: {}", e);
                    }
                }
            }
            let _ = self.events_tx.send(TaskEvent::Upsert(task));
        }
        Ok(revision)
    }

    async fn open_watches(
        &self,
        project_id: i64,
        from_revision: i64,
    ) -> CrondResult<(WatchStream, WatchStream, WatchStream)> {
        let tasks = self
            .coordinator
            .watch(&self.keys.task_prefix(project_id), from_revision)
            .await?;
        let killer = self
            .coordinator
            .watch(&self.keys.killer_prefix(project_id), from_revision)
            .await?;
        let temp = self
            .coordinator
            .watch(&self.keys.temp_prefix(project_id), from_revision)
            .await?;
        Ok((tasks, killer, temp))
    }

    async fn route(&self, project_id: i64, kind: WatchKind, event: WatchEvent) {
        match kind {
            WatchKind::Task => match event.event_type {
                EventType::Put => match decode_task(&event.value) {
                    Ok(task) => {
                        let _ = self.events_tx.send(TaskEvent::Upsert(task));
                    }
                    Err(e) => self.alert_malformed(&event.key, &e).await,
                },
                EventType::Delete => {
                    if let Some((pid, tid)) = self.keys.split_project_key("tasks", &event.key) {
                        let _ = self.events_tx.send(TaskEvent::Remove {
                            project_id: pid,
                            task_id: tid.to_string(),
                        });
                    }
                }
            },
            WatchKind::Killer => {
                // killer 键的过期删除不是信号
                if event.event_type == EventType::Put {
                    if let Some((pid, tid)) = self.keys.split_project_key("killer", &event.key) {
                        let _ = self.events_tx.send(TaskEvent::Kill {
                            project_id: pid,
                            task_id: tid.to_string(),
                        });
                    }
                }
            }
            WatchKind::Temp => {
                if event.event_type == EventType::Put {
                    match decode_task(&event.value) {
                        Ok(task) => {
                            // 一次性键：消费后即删，删除失败也会随租约过期
                            if let Err(e) = self.coordinator.delete(&event.key).await {
                                debug!("删除临时调度键失败: {}", e);
                            }
                            let _ = self.events_tx.send(TaskEvent::TempRun(task));
                        }
                        Err(e) => self.alert_malformed(&event.key, &e).await,
                    }
                }
            }
        }
        debug!("项目 {} 事件已路由, 版本 {}", project_id, event.revision);
    }

    async fn alert_malformed(&self, key: &str, err: &CrondError) {
        warn!("键 {} 的载荷损坏，跳过: {}", key, err);
        let report = self
            .warner
            .warning(WarningData::system(
                format!("键 {key} 的载荷损坏: {err}"),
                self.agent_ip.clone(),
            ))
            .await;
        if let Err(e) = report {
            warn!("载荷损坏告警上报失败: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchKind {
    Task,
    Killer,
    Temp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    use crond_core::models::TaskInfo;
    use crond_core::{CrondResult, IdGenerator};
    use crond_coordination::MemoryCoordinator;

    struct RecordingWarner {
        records: Mutex<Vec<WarningData>>,
    }

    #[async_trait]
    impl Warner for RecordingWarner {
        async fn warning(&self, data: WarningData) -> CrondResult<()> {
            self.records.lock().await.push(data);
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<dyn Coordinator>,
        publisher: Arc<TaskPublisher>,
        warner: Arc<RecordingWarner>,
        watcher: Arc<TaskWatcher>,
        events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    }

    fn fixture() -> Fixture {
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let keys = KeyMaker::new("/crond");
        let publisher = Arc::new(TaskPublisher::new(
            Arc::clone(&coordinator),
            keys.clone(),
            Arc::new(IdGenerator::new(1)),
        ));
        let warner = Arc::new(RecordingWarner {
            records: Mutex::new(Vec::new()),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(TaskWatcher::new(
            Arc::clone(&coordinator),
            keys,
            Arc::clone(&publisher),
            warner.clone() as Arc<dyn Warner>,
            "127.0.0.1",
            events_tx,
        ));
        Fixture {
            coordinator,
            publisher,
            warner,
            watcher,
            events_rx,
        }
    }

    fn task(task_id: &str) -> TaskInfo {
        TaskInfo {
            project_id: 1,
            task_id: task_id.to_string(),
            name: format!("task-{task_id}"),
            command: "echo hi".to_string(),
            cron_expr: "*/2 * * * * *".to_string(),
            remark: String::new(),
            timeout_seconds: 10,
            create_time: 0,
            is_running: false,
            noseize: false,
        }
    }

    async fn recv(events_rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> TaskEvent {
        timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("等待事件超时")
            .expect("事件通道关闭")
    }

    #[tokio::test]
    async fn test_snapshot_then_deltas_converge() {
        let mut f = fixture();
        f.publisher.save_task(task("a")).await.unwrap();
        f.publisher.save_task(task("b")).await.unwrap();

        let watcher = Arc::clone(&f.watcher);
        tokio::spawn(async move { watcher.run_project(1).await });

        // 快照产生两条 Upsert
        let mut plan: HashMap<String, TaskInfo> = HashMap::new();
        for _ in 0..2 {
            match recv(&mut f.events_rx).await {
                TaskEvent::Upsert(t) => {
                    plan.insert(t.task_id.clone(), t);
                }
                other => panic!("期望 Upsert, 收到 {other:?}"),
            }
        }

        // 快照之后的增量
        f.publisher.save_task(task("c")).await.unwrap();
        f.publisher.delete_task(1, "a").await.unwrap();

        for _ in 0..2 {
            match recv(&mut f.events_rx).await {
                TaskEvent::Upsert(t) => {
                    plan.insert(t.task_id.clone(), t);
                }
                TaskEvent::Remove { task_id, .. } => {
                    plan.remove(&task_id);
                }
                other => panic!("意外事件 {other:?}"),
            }
        }

        // 静默后计划与协调器中的存活键一致
        let live = f.publisher.get_task_list(1).await.unwrap();
        assert_eq!(plan.len(), live.len());
        for t in live {
            assert!(plan.contains_key(&t.task_id));
        }
    }

    #[tokio::test]
    async fn test_kill_and_temp_routing() {
        let mut f = fixture();
        let watcher = Arc::clone(&f.watcher);
        tokio::spawn(async move { watcher.run_project(1).await });
        // 等监听建立，早于监听的信号不在投递范围内
        tokio::time::sleep(Duration::from_millis(200)).await;

        f.publisher.kill_task(1, "x").await.unwrap();
        match recv(&mut f.events_rx).await {
            TaskEvent::Kill {
                project_id,
                task_id,
            } => {
                assert_eq!((project_id, task_id.as_str()), (1, "x"));
            }
            other => panic!("期望 Kill, 收到 {other:?}"),
        }

        f.publisher
            .temporary_scheduler_task(&task("y"))
            .await
            .unwrap();
        match recv(&mut f.events_rx).await {
            TaskEvent::TempRun(t) => assert_eq!(t.task_id, "y"),
            other => panic!("期望 TempRun, 收到 {other:?}"),
        }
        // 一次性键被消费后删除
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.coordinator.get("/crond/temp/1/y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped_with_alert() {
        let mut f = fixture();
        let watcher = Arc::clone(&f.watcher);
        tokio::spawn(async move { watcher.run_project(1).await });

        f.publisher.save_task(task("ok")).await.unwrap();
        f.coordinator
            .put("/crond/tasks/1/broken", "{not-json", None)
            .await
            .unwrap();

        // 合法任务照常送达
        match recv(&mut f.events_rx).await {
            TaskEvent::Upsert(t) => assert_eq!(t.task_id, "ok"),
            other => panic!("期望 Upsert, 收到 {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let records = f.warner.records.lock().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].data.contains("broken"));
    }

    /// 包装内存协调器，前几次 watch 调用模拟传输故障
    struct FlakyCoordinator {
        inner: MemoryCoordinator,
        watch_failures_left: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Coordinator for FlakyCoordinator {
        async fn get(&self, key: &str) -> CrondResult<Option<crond_coordination::KeyValue>> {
            self.inner.get(key).await
        }
        async fn put(
            &self,
            key: &str,
            value: &str,
            lease: Option<crond_coordination::LeaseId>,
        ) -> CrondResult<()> {
            self.inner.put(key, value, lease).await
        }
        async fn delete(&self, key: &str) -> CrondResult<()> {
            self.inner.delete(key).await
        }
        async fn range(
            &self,
            prefix: &str,
        ) -> CrondResult<(Vec<crond_coordination::KeyValue>, i64)> {
            self.inner.range(prefix).await
        }
        async fn watch(&self, prefix: &str, from_revision: i64) -> CrondResult<WatchStream> {
            use std::sync::atomic::Ordering;
            let left = self.watch_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.watch_failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CrondError::coordinator("connection refused"));
            }
            self.inner.watch(prefix, from_revision).await
        }
        async fn lease_grant(&self, ttl_seconds: i64) -> CrondResult<crond_coordination::LeaseId> {
            self.inner.lease_grant(ttl_seconds).await
        }
        async fn lease_keep_alive(&self, lease: crond_coordination::LeaseId) -> CrondResult<()> {
            self.inner.lease_keep_alive(lease).await
        }
        async fn lease_revoke(&self, lease: crond_coordination::LeaseId) -> CrondResult<()> {
            self.inner.lease_revoke(lease).await
        }
        async fn put_if_absent(
            &self,
            key: &str,
            value: &str,
            lease: Option<crond_coordination::LeaseId>,
        ) -> CrondResult<bool> {
            self.inner.put_if_absent(key, value, lease).await
        }
        async fn inc(&self, key: &str) -> CrondResult<i64> {
            self.inner.inc(key).await
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_watch_failures() {
        // 前两次建立监听失败，watcher 应退避重连后收敛
        let coordinator: Arc<dyn Coordinator> = Arc::new(FlakyCoordinator {
            inner: MemoryCoordinator::new(),
            watch_failures_left: std::sync::atomic::AtomicU32::new(2),
        });
        let keys = KeyMaker::new("/crond");
        let publisher = Arc::new(TaskPublisher::new(
            Arc::clone(&coordinator),
            keys.clone(),
            Arc::new(IdGenerator::new(1)),
        ));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(TaskWatcher::new(
            Arc::clone(&coordinator),
            keys,
            Arc::clone(&publisher),
            Arc::new(crond_core::LogWarner),
            "127.0.0.1",
            events_tx,
        ));
        tokio::spawn(async move { watcher.run_project(1).await });

        publisher.save_task(task("late")).await.unwrap();
        // 第一轮建立监听失败 + 1 秒退避，重连后事件仍应送达
        let event = timeout(Duration::from_secs(8), events_rx.recv())
            .await
            .expect("重连后应收到事件")
            .expect("事件通道关闭");
        match event {
            TaskEvent::Upsert(t) => assert_eq!(t.task_id, "late"),
            other => panic!("期望 Upsert, 收到 {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_running_flag_cleared_on_snapshot() {
        let f = fixture();
        let mut stale = task("stale");
        stale.is_running = true;
        f.publisher.save_task(stale).await.unwrap();

        // 没有任何锁键存在，快照应清除残留标记
        f.watcher.snapshot(1).await.unwrap();
        let current = f.publisher.get_task(1, "stale").await.unwrap().unwrap();
        assert!(!current.is_running);
    }
}
