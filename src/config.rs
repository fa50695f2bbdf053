use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// 健康检查触发的自动重启策略
    #[serde(default)]
    pub restart: RestartPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,

    /// 推流配置持久化文件
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// 未指定输出地址时使用的默认推流地址
    #[serde(default = "default_output_url")]
    pub default_output_url: String,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_sec: u64,

    /// 启动后等待多久再确认进程存活 (毫秒)
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// 停止时 SIGTERM 到 SIGKILL 的等待时间 (毫秒)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_status_cache_ttl")]
    pub status_cache_ttl_sec: u64,

    /// API 新增推流时的最大尝试次数
    #[serde(default = "default_add_attempts")]
    pub add_attempts: u32,

    /// 是否让 ffmpeg 通过 `-progress pipe:1` 上报进度
    #[serde(default = "default_progress_report")]
    pub progress_report: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ffmpeg_binary: default_ffmpeg_binary(),
            store_path: default_store_path(),
            default_output_url: default_output_url(),
            health_check_interval_sec: default_health_check_interval(),
            startup_grace_ms: default_startup_grace(),
            stop_timeout_ms: default_stop_timeout(),
            status_cache_ttl_sec: default_status_cache_ttl(),
            add_attempts: default_add_attempts(),
            progress_report: default_progress_report(),
        }
    }
}

impl ServerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_sec)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// 连续重启失败的上限 (0 表示无限重试，每个检查周期一次)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避时间 (秒)，0 表示仅依赖检查周期
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_sec: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_sec: default_initial_backoff(),
            max_backoff_sec: default_max_backoff(),
        }
    }
}

impl RestartPolicy {
    /// 第 `failures` 次连续失败之后的退避时间
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 || self.initial_backoff_sec == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(failures - 1);
        let secs = std::cmp::min(
            self.max_backoff_sec,
            self.initial_backoff_sec.saturating_mul(factor),
        );
        Duration::from_secs(secs)
    }

    /// 是否已经用尽重试次数
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_store_path() -> String {
    "data/streams.json".to_string()
}

fn default_output_url() -> String {
    "rtmp://localhost:1935/live/".to_string()
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_startup_grace() -> u64 {
    2000
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_status_cache_ttl() -> u64 {
    300
}

fn default_add_attempts() -> u32 {
    3
}

fn default_progress_report() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    60
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
