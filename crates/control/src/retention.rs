//! 日志保留清理
//!
//! 每 12 小时清理一次 `start_time` 早于 7 天前的任务日志。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{error, info};

use crond_core::CrondResult;

use crate::selector::{Op, Selector};
use crate::store::TaskLogStore;

pub const RETENTION_SECONDS: i64 = 7 * 86400;
const SWEEP_PERIOD: Duration = Duration::from_secs(12 * 3600);

pub struct RetentionSweeper {
    task_log: Arc<dyn TaskLogStore>,
}

impl RetentionSweeper {
    pub fn new(task_log: Arc<dyn TaskLogStore>) -> Self {
        Self { task_log }
    }

    /// 清理一轮：删除 `start_time < now - 7d` 的所有日志
    pub async fn sweep_once(&self, now_ts: i64) -> CrondResult<()> {
        let cutoff = now_ts - RETENTION_SECONDS;
        self.task_log
            .clean(
                None,
                &Selector::new().with("start_time", Op::LessThan, cutoff),
            )
            .await
    }

    /// 常驻清理循环；首轮在一个周期之后
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + SWEEP_PERIOD, SWEEP_PERIOD);
        info!("日志保留清理已启动, 周期 {:?}", SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now().timestamp()).await {
                        error!("日志清理失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("日志保留清理收到关闭信号");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crond_core::models::TaskLog;

    use crate::selector::Value;
    use crate::store::Tx;

    /// 以内存 Vec 模拟 task_log 表，按选择器语义过滤
    struct MockTaskLogStore {
        logs: Mutex<Vec<TaskLog>>,
    }

    fn matches(log: &TaskLog, selector: &Selector) -> bool {
        selector.requirements.iter().all(|req| {
            match (req.field, &req.op, &req.value) {
                ("start_time", Op::LessThan, Value::Int(v)) => log.start_time < *v,
                ("project_id", Op::Equals, Value::Int(v)) => log.project_id == *v,
                _ => false,
            }
        })
    }

    #[async_trait]
    impl TaskLogStore for MockTaskLogStore {
        async fn create(&self, _tx: Option<&mut Tx>, log: &TaskLog) -> CrondResult<()> {
            self.logs.lock().await.push(log.clone());
            Ok(())
        }

        async fn get_list(&self, selector: &Selector) -> CrondResult<Vec<TaskLog>> {
            Ok(self
                .logs
                .lock()
                .await
                .iter()
                .filter(|log| matches(log, selector))
                .cloned()
                .collect())
        }

        async fn get_total(&self, selector: &Selector) -> CrondResult<i64> {
            Ok(self.get_list(selector).await?.len() as i64)
        }

        async fn clean(&self, _tx: Option<&mut Tx>, selector: &Selector) -> CrondResult<()> {
            self.logs.lock().await.retain(|log| !matches(log, selector));
            Ok(())
        }
    }

    fn log_at(start_time: i64) -> TaskLog {
        TaskLog {
            id: 0,
            project_id: 1,
            task_id: "a".to_string(),
            name: "demo".to_string(),
            result: "hi\n".to_string(),
            start_time,
            end_time: start_time + 1,
            command: "echo hi".to_string(),
            with_error: 0,
            client_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_exactly_stale_rows() {
        let store = Arc::new(MockTaskLogStore {
            logs: Mutex::new(Vec::new()),
        });
        let now = 1_700_000_000i64;
        // 10 条 8 天前的，10 条 1 天前的
        for i in 0..10 {
            store
                .create(None, &log_at(now - 8 * 86400 + i))
                .await
                .unwrap();
            store.create(None, &log_at(now - 86400 + i)).await.unwrap();
        }

        let sweeper = RetentionSweeper::new(store.clone() as Arc<dyn TaskLogStore>);
        sweeper.sweep_once(now).await.unwrap();

        let remaining = store.logs.lock().await;
        assert_eq!(remaining.len(), 10);
        assert!(remaining
            .iter()
            .all(|log| log.start_time >= now - RETENTION_SECONDS));
    }

    #[tokio::test]
    async fn test_sweep_idempotent_on_empty() {
        let store = Arc::new(MockTaskLogStore {
            logs: Mutex::new(Vec::new()),
        });
        let sweeper = RetentionSweeper::new(store as Arc<dyn TaskLogStore>);
        sweeper.sweep_once(1_700_000_000).await.unwrap();
        sweeper.sweep_once(1_700_000_000).await.unwrap();
    }
}
