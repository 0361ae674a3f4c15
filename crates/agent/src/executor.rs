//! 子进程执行器
//!
//! 以 `sh -c` 运行任务命令，合并捕获 stdout+stderr（超限截断），
//! 超时与杀死信号走同一条取消路径：SIGTERM，等宽限期，再 SIGKILL。

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crond_core::models::{TaskExecuteResult, TaskInfo};

const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// 取消句柄，杀死信号与超时共用；取消是幂等的
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 单次执行的环境
pub struct RunContext {
    pub client_ip: String,
    pub output_limit_bytes: usize,
    pub grace: Duration,
    pub cancel: CancelHandle,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Timeout,
    Killed,
}

/// 执行一次任务并产出上报结果；本函数不返回错误，
/// 所有失败形态都落在结果的 `error` 字段里
pub async fn execute(task: &TaskInfo, ctx: &RunContext) -> TaskExecuteResult {
    let start_time = Utc::now().timestamp();
    let mut result = TaskExecuteResult {
        project_id: task.project_id,
        task_id: task.task_id.clone(),
        name: task.name.clone(),
        command: task.command.clone(),
        start_time,
        end_time: start_time,
        exit_status: None,
        output: String::new(),
        error: None,
        client_ip: ctx.client_ip.clone(),
    };

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&task.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            result.end_time = Utc::now().timestamp();
            result.error = Some(format!("spawn failed: {e}"));
            return result;
        }
    };

    debug!(
        "启动子进程: {}/{} pid={:?}",
        task.project_id,
        task.task_id,
        child.id()
    );

    // 管道读取必须与 wait 并行，否则子进程可能因管道写满而卡死
    let limit = ctx.output_limit_bytes;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let reader = tokio::spawn(async move {
        let out = async {
            match stdout {
                Some(r) => read_capped(r, limit).await,
                None => (Vec::new(), false),
            }
        };
        let err = async {
            match stderr {
                Some(r) => read_capped(r, limit).await,
                None => (Vec::new(), false),
            }
        };
        tokio::join!(out, err)
    });

    let has_timeout = task.timeout_seconds > 0;
    let timeout_duration = Duration::from_secs(task.timeout_seconds.max(0) as u64);

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status),
            Err(e) => {
                result.end_time = Utc::now().timestamp();
                result.error = Some(format!("wait failed: {e}"));
                return result;
            }
        },
        _ = ctx.cancel.cancelled() => Outcome::Killed,
        _ = sleep(timeout_duration), if has_timeout => Outcome::Timeout,
    };

    if !matches!(outcome, Outcome::Exited(_)) {
        terminate(&mut child, ctx.grace).await;
    }

    let ((out_buf, out_trunc), (err_buf, err_trunc)) = match reader.await {
        Ok(buffers) => buffers,
        Err(e) => {
            warn!("读取任务输出失败: {}", e);
            ((Vec::new(), false), (Vec::new(), false))
        }
    };
    result.output = combine_output(out_buf, err_buf, limit, out_trunc || err_trunc);
    result.end_time = Utc::now().timestamp();

    match outcome {
        Outcome::Exited(status) => {
            result.exit_status = status.code();
            if !status.success() {
                result.error = Some(match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "killed by signal".to_string(),
                });
            }
        }
        Outcome::Timeout => result.error = Some("timeout".to_string()),
        Outcome::Killed => result.error = Some("killed".to_string()),
    }

    result
}

/// SIGTERM，等待宽限期，仍未退出则 SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // 子进程已经退出
        let _ = child.wait().await;
        return;
    };

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }

    if timeout(grace, child.wait()).await.is_err() {
        warn!("子进程 {} 未响应 SIGTERM，升级为 SIGKILL", pid);
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

/// 读到上限后继续消费但不再累积，避免子进程写管道阻塞
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < limit {
                    let take = n.min(limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

fn combine_output(out: Vec<u8>, err: Vec<u8>, limit: usize, truncated: bool) -> String {
    let mut combined = String::from_utf8_lossy(&out).into_owned();
    if !err.is_empty() {
        combined.push_str(&String::from_utf8_lossy(&err));
    }
    let mut was_truncated = truncated;
    if combined.len() > limit {
        // 按字符边界截断
        let mut cut = limit;
        while cut > 0 && !combined.is_char_boundary(cut) {
            cut -= 1;
        }
        combined.truncate(cut);
        was_truncated = true;
    }
    if was_truncated {
        combined.push_str(TRUNCATED_MARKER);
    }
    combined
}
