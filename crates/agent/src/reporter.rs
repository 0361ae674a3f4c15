//! 结果上报
//!
//! HTTP 上报实现：把执行结果 POST 给控制面的收集接口；
//! 该实现同时充当 Warner，把告警送往同一地址。
//! 上报失败按有界指数退避重试，最终失败交给 Warner。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, warn};

use crond_core::models::TaskExecuteResult;
use crond_core::{CrondError, CrondResult, TaskReporter, Warner, WarningData};

const REPORT_ATTEMPTS: u32 = 3;
const REPORT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

pub struct HttpReporter {
    client: reqwest::Client,
    result_url: String,
    warning_url: String,
}

impl HttpReporter {
    pub fn new(report_addr: &str) -> Self {
        let base = report_addr.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            result_url: format!("{base}/api/v1/report/result"),
            warning_url: format!("{base}/api/v1/report/warning"),
        }
    }

    async fn post_json<T: serde::Serialize>(&self, url: &str, body: &T) -> CrondResult<()> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| CrondError::internal("上报请求失败", e))?;
        if !resp.status().is_success() {
            return Err(CrondError::internal(
                "上报被拒绝",
                format!("{} -> {}", url, resp.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskReporter for HttpReporter {
    async fn result_report(&self, result: &TaskExecuteResult) -> CrondResult<()> {
        self.post_json(&self.result_url, result).await
    }
}

#[async_trait]
impl Warner for HttpReporter {
    async fn warning(&self, data: WarningData) -> CrondResult<()> {
        self.post_json(&self.warning_url, &data).await
    }
}

/// 带重试的上报；重试耗尽后告警
pub async fn report_with_retry(
    reporter: &Arc<dyn TaskReporter>,
    warner: &Arc<dyn Warner>,
    agent_ip: &str,
    result: &TaskExecuteResult,
) {
    let mut backoff = REPORT_BACKOFF_INITIAL;
    for attempt in 1..=REPORT_ATTEMPTS {
        match reporter.result_report(result).await {
            Ok(()) => return,
            Err(e) if attempt < REPORT_ATTEMPTS => {
                warn!(
                    "任务 {}/{} 结果上报失败(第{}次): {}",
                    result.project_id, result.task_id, attempt, e
                );
                sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(
                    "任务 {}/{} 结果上报重试耗尽: {}",
                    result.project_id, result.task_id, e
                );
                let report = warner
                    .warning(WarningData::task(
                        format!(
                            "任务 {}/{} 执行结果上报失败: {e}",
                            result.project_id, result.task_id
                        ),
                        agent_ip.to_string(),
                    ))
                    .await;
                if let Err(warn_err) = report {
                    error!("上报失败告警同样失败: {}", warn_err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Mutex;

    struct FlakyReporter {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskReporter for FlakyReporter {
        async fn result_report(&self, _result: &TaskExecuteResult) -> CrondResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(CrondError::internal("上报请求失败", "refused"))
            } else {
                Ok(())
            }
        }
    }

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

    fn sample_result() -> TaskExecuteResult {
        TaskExecuteResult {
            project_id: 1,
            task_id: "a".to_string(),
            name: "demo".to_string(),
            command: "echo hi".to_string(),
            start_time: 1,
            end_time: 2,
            exit_status: Some(0),
            output: "hi\n".to_string(),
            error: None,
            client_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retry_then_success_no_warning() {
        let reporter: Arc<dyn TaskReporter> = Arc::new(FlakyReporter {
            calls: AtomicU32::new(0),
            fail_first: 1,
        });
        let warner_impl = Arc::new(RecordingWarner {
            records: Mutex::new(Vec::new()),
        });
        let warner: Arc<dyn Warner> = warner_impl.clone();

        report_with_retry(&reporter, &warner, "127.0.0.1", &sample_result()).await;
        assert!(warner_impl.records.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_warn() {
        let reporter: Arc<dyn TaskReporter> = Arc::new(FlakyReporter {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let warner_impl = Arc::new(RecordingWarner {
            records: Mutex::new(Vec::new()),
        });
        let warner: Arc<dyn Warner> = warner_impl.clone();

        report_with_retry(&reporter, &warner, "127.0.0.1", &sample_result()).await;
        let records = warner_impl.records.lock().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].data.contains("1/a"));
    }

    #[test]
    fn test_http_reporter_urls() {
        let reporter = HttpReporter::new("http://127.0.0.1:8000/");
        assert_eq!(
            reporter.result_url,
            "http://127.0.0.1:8000/api/v1/report/result"
        );
        assert_eq!(
            reporter.warning_url,
            "http://127.0.0.1:8000/api/v1/report/warning"
        );
    }
}
