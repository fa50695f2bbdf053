use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stream::StreamState;
use crate::supervisor::Supervisor;

/// 一轮健康检查的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub running: usize,
    pub restarting: usize,
    pub unhealthy: usize,
    pub failed: usize,
    /// 检查前已被停止的流
    pub skipped: usize,
    /// 检查任务 panic 的流
    pub panicked: usize,
}

/// 后台健康检查任务
///
/// # 任务流程：
/// - 每隔固定周期对所有活跃流执行一次 `status`
/// - 进程意外退出时由 `status` 同步触发重启 (按重启策略退避)
/// - 单个流的检查出错或 panic 只记录日志，不影响其他流和下一轮
pub struct HealthChecker {
    supervisor: Arc<Supervisor>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
        }
    }

    /// 循环检查直到取消
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Health checker started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "Health check finished");
                }
            }
        }

        info!("Health checker stopped");
    }

    /// 对当前所有活跃流执行一轮检查
    pub async fn tick(&self) -> HealthReport {
        let mut report = HealthReport::default();

        // 快照 id 列表，检查期间新增的流留到下一轮
        for id in self.supervisor.active_ids() {
            if !self.supervisor.is_live(&id) {
                report.skipped += 1;
                continue;
            }
            report.checked += 1;

            let supervisor = self.supervisor.clone();
            let task_id = id.clone();
            let result = tokio::spawn(async move { supervisor.status(&task_id).await }).await;

            match result {
                Ok(Ok(status)) => match status.state {
                    StreamState::Running => report.running += 1,
                    StreamState::Restarting => report.restarting += 1,
                    StreamState::Unhealthy => {
                        warn!(stream_id = %id, "Stream is unhealthy: {:?}", status.detail);
                        report.unhealthy += 1;
                    }
                    StreamState::Failed => report.failed += 1,
                    StreamState::Stopped | StreamState::Starting => {}
                },
                Ok(Err(e)) => error!(stream_id = %id, "Health check error: {}", e),
                Err(e) => {
                    error!(stream_id = %id, "Health check task panicked: {}", e);
                    report.panicked += 1;
                }
            }
        }

        report
    }
}
