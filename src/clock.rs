use tokio::time::Instant;

/// 时间来源，注入到缓存与监督器中
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// 基于 tokio 计时器的时钟，测试中可通过 `tokio::time::pause` 控制
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
