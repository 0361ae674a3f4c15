use thiserror::Error;

/// 平台统一错误类型
///
/// 后台循环只对 `is_retryable` 的错误做退避重试，
/// 管理接口将 `Internal` 映射为 5xx 并只向调用方暴露 `msg`。
#[derive(Debug, Error)]
pub enum CrondError {
    #[error("协调器不可用: {0}")]
    CoordinatorUnavailable(String),

    /// 锁竞争的预期结果，不算故障
    #[error("任务锁已被其他节点持有")]
    AlreadyLocked,

    #[error("无效的CRON表达式: {expr} - {message}")]
    BadCron { expr: String, message: String },

    #[error("载荷解码失败: {0}")]
    MalformedPayload(String),

    /// watch 起始版本已被压缩，调用方需要回退到全量快照
    #[error("监听起点已被压缩")]
    CompactedRevision,

    #[error("项目不存在")]
    ProjectNotExist,

    #[error("记录不存在")]
    RecordNotFound,

    #[error("任务执行超时")]
    ChildTimeout,

    #[error("任务被强制终止")]
    ChildKilled,

    #[error("{msg}")]
    Internal { msg: String, log: String },

    #[error("配置错误: {0}")]
    Configuration(String),
}

pub type CrondResult<T> = Result<T, CrondError>;

impl CrondError {
    /// 内部错误：`msg` 面向调用方，`log` 保留原始细节
    pub fn internal<M: Into<String>, L: ToString>(msg: M, log: L) -> Self {
        Self::Internal {
            msg: msg.into(),
            log: log.to_string(),
        }
    }

    pub fn coordinator<E: ToString>(err: E) -> Self {
        Self::CoordinatorUnavailable(err.to_string())
    }

    pub fn bad_cron<E: ToString>(expr: &str, err: E) -> Self {
        Self::BadCron {
            expr: expr.to_string(),
            message: err.to_string(),
        }
    }

    /// 是否适合在后台循环中退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CoordinatorUnavailable(_))
    }

    /// 是否属于锁竞争这类预期内的结果
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyLocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_keeps_detail() {
        let err = CrondError::internal("获取项目信息失败", "connection refused");
        match &err {
            CrondError::Internal { msg, log } => {
                assert_eq!(msg, "获取项目信息失败");
                assert_eq!(log, "connection refused");
            }
            _ => panic!("unexpected variant"),
        }
        // Display 只暴露 msg
        assert_eq!(err.to_string(), "获取项目信息失败");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CrondError::coordinator("timeout").is_retryable());
        assert!(!CrondError::AlreadyLocked.is_retryable());
        assert!(CrondError::AlreadyLocked.is_contention());
    }
}
