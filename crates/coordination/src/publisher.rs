//! 任务发布（控制面侧）
//!
//! 任务定义的权威写入口：写入 `tasks/{project}/{task}` 后由各
//! agent 的 watch 流最终一致地收敛，发布方不等待 agent 确认。
//! 杀死信号与临时调度通过短租约键投递，到期自清理。

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tracing::info;

use crond_core::keys::{decode_task, encode, KeyMaker};
use crond_core::models::TaskInfo;
use crond_core::{CrondError, CrondResult, IdGenerator};

use crate::kv::Coordinator;

/// 杀死信号键的存活时间
const KILLER_TTL_SECONDS: i64 = 5;
/// 临时调度键的存活时间，一次性消费
const TEMP_TTL_SECONDS: i64 = 10;

pub struct TaskPublisher {
    coordinator: Arc<dyn Coordinator>,
    keys: KeyMaker,
    idgen: Arc<IdGenerator>,
}

impl TaskPublisher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keys: KeyMaker,
        idgen: Arc<IdGenerator>,
    ) -> Self {
        Self {
            coordinator,
            keys,
            idgen,
        }
    }

    /// 保存任务定义，覆盖写时返回旧值
    ///
    /// cron 表达式非法返回 `ErrBadCron`，任务不会被写入；
    /// `task_id` 为空时由 ID 生成器补齐。
    pub async fn save_task(&self, mut task: TaskInfo) -> CrondResult<Option<TaskInfo>> {
        Schedule::from_str(&task.cron_expr)
            .map_err(|e| CrondError::bad_cron(&task.cron_expr, e))?;

        if task.task_id.is_empty() {
            task.task_id = self.idgen.next_task_id()?;
        }
        if task.create_time == 0 {
            task.create_time = Utc::now().timestamp();
        }

        let key = self.keys.task_key(task.project_id, &task.task_id);
        let prior = match self.coordinator.get(&key).await? {
            Some(kv) => Some(decode_task(&kv.value)?),
            None => None,
        };
        self.coordinator.put(&key, &encode(&task)?, None).await?;
        info!("任务已发布: {}/{}", task.project_id, task.task_id);
        Ok(prior)
    }

    /// 删除任务定义，返回被删除的旧值；墓碑经 watch 流送达 agent
    pub async fn delete_task(
        &self,
        project_id: i64,
        task_id: &str,
    ) -> CrondResult<Option<TaskInfo>> {
        let key = self.keys.task_key(project_id, task_id);
        let prior = match self.coordinator.get(&key).await? {
            Some(kv) => Some(decode_task(&kv.value)?),
            None => None,
        };
        self.coordinator.delete(&key).await?;
        Ok(prior)
    }

    pub async fn get_task(&self, project_id: i64, task_id: &str) -> CrondResult<Option<TaskInfo>> {
        let key = self.keys.task_key(project_id, task_id);
        match self.coordinator.get(&key).await? {
            Some(kv) => Ok(Some(decode_task(&kv.value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_task_list(&self, project_id: i64) -> CrondResult<Vec<TaskInfo>> {
        let (kvs, _) = self
            .coordinator
            .range(&self.keys.task_prefix(project_id))
            .await?;
        kvs.iter().map(|kv| decode_task(&kv.value)).collect()
    }

    /// 置位/清除任务的运行标记
    ///
    /// 标记只是尽力而为的状态展示，总是基于协调器里的最新任务值改写，
    /// 任务已被删除时不做任何事。
    pub async fn set_task_running(
        &self,
        project_id: i64,
        task_id: &str,
        running: bool,
    ) -> CrondResult<()> {
        let key = self.keys.task_key(project_id, task_id);
        let Some(kv) = self.coordinator.get(&key).await? else {
            return Ok(());
        };
        let mut task = decode_task(&kv.value)?;
        if task.is_running == running {
            return Ok(());
        }
        task.is_running = running;
        self.coordinator.put(&key, &encode(&task)?, None).await
    }

    /// 投递杀死信号：写入带短租约的 killer 键，由 watch 到它的
    /// agent 取消正在执行的子进程
    pub async fn kill_task(&self, project_id: i64, task_id: &str) -> CrondResult<()> {
        let lease = self.coordinator.lease_grant(KILLER_TTL_SECONDS).await?;
        self.coordinator
            .put(
                &self.keys.killer_key(project_id, task_id),
                "1",
                Some(lease),
            )
            .await?;
        info!("杀死信号已投递: {}/{}", project_id, task_id);
        Ok(())
    }

    /// 临时调度：绕过 cron 计划立即执行一次
    pub async fn temporary_scheduler_task(&self, task: &TaskInfo) -> CrondResult<()> {
        let lease = self.coordinator.lease_grant(TEMP_TTL_SECONDS).await?;
        self.coordinator
            .put(
                &self.keys.temp_key(task.project_id, &task.task_id),
                &encode(task)?,
                Some(lease),
            )
            .await?;
        info!("临时调度已投递: {}/{}", task.project_id, task.task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::memory::MemoryCoordinator;

    fn task(project_id: i64, task_id: &str, cron_expr: &str) -> TaskInfo {
        TaskInfo {
            project_id,
            task_id: task_id.to_string(),
            name: format!("task-{task_id}"),
            command: "echo hi".to_string(),
            cron_expr: cron_expr.to_string(),
            remark: String::new(),
            timeout_seconds: 10,
            create_time: 0,
            is_running: false,
            noseize: false,
        }
    }

    fn publisher(coord: &Arc<dyn Coordinator>) -> TaskPublisher {
        TaskPublisher::new(
            Arc::clone(coord),
            KeyMaker::new("/crond"),
            Arc::new(IdGenerator::new(1)),
        )
    }

    #[tokio::test]
    async fn test_save_task_assigns_id_and_returns_prior() {
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let publisher = publisher(&coord);

        let mut t = task(1, "", "*/2 * * * * *");
        t.name = "first".to_string();
        let prior = publisher.save_task(t.clone()).await.unwrap();
        assert!(prior.is_none());

        let list = publisher.get_task_list(1).await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list[0].task_id.is_empty(), "空 task_id 应被补齐");
        assert!(list[0].create_time > 0);

        // 覆盖写返回旧值
        let mut updated = list[0].clone();
        updated.name = "second".to_string();
        let prior = publisher.save_task(updated).await.unwrap().unwrap();
        assert_eq!(prior.name, "first");
    }

    #[tokio::test]
    async fn test_save_task_bad_cron_not_installed() {
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let publisher = publisher(&coord);

        let err = publisher
            .save_task(task(1, "bad", "not-a-cron"))
            .await
            .unwrap_err();
        assert!(matches!(err, CrondError::BadCron { .. }));
        assert!(publisher.get_task_list(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_task_returns_prior() {
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let publisher = publisher(&coord);

        publisher
            .save_task(task(1, "a", "*/2 * * * * *"))
            .await
            .unwrap();
        let prior = publisher.delete_task(1, "a").await.unwrap().unwrap();
        assert_eq!(prior.task_id, "a");
        assert!(publisher.delete_task(1, "a").await.unwrap().is_none());
        assert!(publisher.get_task(1, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_running_flag_roundtrip() {
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let publisher = publisher(&coord);

        publisher
            .save_task(task(1, "a", "*/2 * * * * *"))
            .await
            .unwrap();
        publisher.set_task_running(1, "a", true).await.unwrap();
        assert!(publisher.get_task(1, "a").await.unwrap().unwrap().is_running);
        publisher.set_task_running(1, "a", false).await.unwrap();
        assert!(!publisher.get_task(1, "a").await.unwrap().unwrap().is_running);
        // 任务不存在时静默成功
        publisher.set_task_running(1, "gone", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_killer_and_temp_keys_expire() {
        let coord: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let publisher = TaskPublisher::new(
            Arc::clone(&coord),
            KeyMaker::new("/crond"),
            Arc::new(IdGenerator::new(1)),
        );

        publisher.kill_task(1, "a").await.unwrap();
        assert!(coord.get("/crond/killer/1/a").await.unwrap().is_some());
        let t = task(1, "a", "*/2 * * * * *");
        publisher.temporary_scheduler_task(&t).await.unwrap();
        let kv = coord.get("/crond/temp/1/a").await.unwrap().unwrap();
        assert_eq!(decode_task(&kv.value).unwrap().task_id, "a");

        // killer 键 5 秒租约到期自清理；这里只验证键确实挂在租约上，
        // 等完整 TTL 交给内存协调器的租约测试
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord.get("/crond/killer/1/a").await.unwrap().is_some());
    }
}
