use tokio::time::Instant;

use crate::engine::ProcessHandle;
use crate::stream::{StreamConfig, StreamState, StreamStatus};

/// 运行时的流实例状态
pub struct StreamRuntime {
    /// 启动时冻结的配置快照
    pub config: StreamConfig,
    /// 转推子进程句柄 (启动中、或重启失败等待下次重试时为空)
    pub process: Option<ProcessHandle>,
    /// 进程启动时间 (用于计算运行时长)
    pub started_at: Instant,
    pub state: StreamState,
    /// 连续重启失败次数
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
}

impl StreamRuntime {
    pub fn running(config: StreamConfig, process: ProcessHandle, now: Instant) -> Self {
        Self {
            config,
            process: Some(process),
            started_at: now,
            state: StreamState::Running,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    /// 启动中的占位记录，进程在宽限期确认后才会填入
    pub fn starting(config: StreamConfig, now: Instant) -> Self {
        Self {
            config,
            process: None,
            started_at: now,
            state: StreamState::Starting,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    /// 是否到了可以再次尝试重启的时间
    pub fn retry_due(&self, now: Instant) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }

    pub fn status(&self, now: Instant) -> StreamStatus {
        let pid = self.process.as_ref().map(|p| p.pid());
        StreamStatus {
            id: self.config.id.clone(),
            state: self.state,
            pid,
            uptime_seconds: pid.map(|_| now.duration_since(self.started_at).as_secs()),
            retry_count: self.retry_count,
            detail: self.last_error.clone(),
            config: Some(self.config.clone()),
        }
    }
}
