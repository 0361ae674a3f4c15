//! 后台任务监督器
//!
//! 每个常驻后台任务都包在监督器里运行：panic 被捕获、上报 Warner、
//! 然后带退避重启，单个任务的 panic 不会波及其他任务。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::warning::{Warner, WarningData};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// 运行超过该时长后 panic，视为新一轮故障，退避归零
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);

/// 监督运行 `factory` 产出的后台任务
///
/// 任务正常返回表示自然结束，监督随之结束；panic 则上报并重启。
/// 收到关闭信号时中止当前任务并退出。
pub fn supervise<F, Fut>(
    name: &'static str,
    agent_ip: String,
    warner: Arc<dyn Warner>,
    mut shutdown_rx: broadcast::Receiver<()>,
    factory: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            let started = Instant::now();
            let mut handle = tokio::spawn(factory());

            tokio::select! {
                res = &mut handle => {
                    match res {
                        Ok(()) => {
                            info!("后台任务 {} 正常结束", name);
                            return;
                        }
                        Err(e) if e.is_panic() => {
                            error!("后台任务 {} panic: {}", name, e);
                            let report = warner
                                .warning(WarningData::system(
                                    format!("后台任务 {name} panic: {e}"),
                                    agent_ip.clone(),
                                ))
                                .await;
                            if let Err(report_err) = report {
                                error!("panic 告警上报失败: {}", report_err);
                            }
                        }
                        Err(e) => {
                            // 任务被外部 abort，不再重启
                            info!("后台任务 {} 被中止: {}", name, e);
                            return;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    handle.abort();
                    info!("后台任务 {} 收到关闭信号", name);
                    return;
                }
            }

            if started.elapsed() >= BACKOFF_RESET_AFTER {
                backoff = BACKOFF_INITIAL;
            }
            info!("后台任务 {} 将在 {:?} 后重启", name, backoff);
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown_rx.recv() => {
                    info!("后台任务 {} 收到关闭信号", name);
                    return;
                }
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    })
}
