//! 监督器错误类型。

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Stream [{0}] is already running")]
    AlreadyExists(String),

    #[error("Stream [{0}] not found")]
    NotFound(String),

    /// 进程在启动宽限期内退出，或在启动前即被拒绝
    #[error("Stream [{id}] failed to start: {reason}")]
    LaunchFailed {
        id: String,
        reason: String,
        stderr: String,
    },

    /// 已升级为 SIGKILL；停止本身仍然完成
    #[error("Process {pid} ignored SIGTERM, killed after timeout")]
    StopTimeout { pid: u32 },

    #[error("Probe failed for pid {pid}: {reason}")]
    ProbeFailed { pid: u32, reason: String },

    #[error("Config store write failed for [{id}]: {reason}")]
    PersistenceFailed { id: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub fn launch_failed(
        id: impl Into<String>,
        reason: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::LaunchFailed {
            id: id.into(),
            reason: reason.into(),
            stderr: stderr.into(),
        }
    }

    pub fn persistence(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::PersistenceFailed {
            id: id.into(),
            reason: err.to_string(),
        }
    }

    /// 可供调用方排查的诊断文本 (stderr 片段等)
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::LaunchFailed { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}
