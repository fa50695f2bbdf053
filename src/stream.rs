//! 推流任务的数据模型。

use serde::{Deserialize, Serialize};

use crate::progress::ProgressStats;

/// 一个推流任务的配置 (由配置存储持有，进程启动时冻结一份快照)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub source_url: String,
    /// 为空时回落到服务端配置的默认推流地址
    #[serde(default)]
    pub output_url: String,
    pub key: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gop_size: Option<String>,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_video_codec() -> String {
    "copy".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

impl StreamConfig {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        output_url: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            source_url: source_url.into(),
            output_url: output_url.into(),
            key: key.into(),
            video_codec: default_video_codec(),
            video_bitrate: None,
            video_size: None,
            framerate: None,
            gop_size: None,
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
        }
    }

    pub fn is_video_copy(&self) -> bool {
        self.video_codec == "copy"
    }

    /// 最终推流目标: 输出地址 + 推流码
    pub fn output_target(&self, default_output_url: &str) -> String {
        let base = match self.output_url.trim() {
            "" => default_output_url,
            url => url,
        };
        format!("{}{}", base, self.key)
    }
}

/// 更新请求，缺省字段沿用旧值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPatch {
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub output_url: Option<String>,
    pub key: Option<String>,
    pub video_codec: Option<String>,
    pub video_bitrate: Option<String>,
    pub video_size: Option<String>,
    pub framerate: Option<String>,
    pub gop_size: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_bitrate: Option<String>,
}

impl StreamPatch {
    pub fn apply(&self, base: &StreamConfig) -> StreamConfig {
        fn pick(new: &Option<String>, old: &str) -> String {
            new.clone().unwrap_or_else(|| old.to_string())
        }
        fn pick_opt(new: &Option<String>, old: &Option<String>) -> Option<String> {
            new.clone().or_else(|| old.clone())
        }

        StreamConfig {
            id: base.id.clone(),
            name: pick(&self.name, &base.name),
            source_url: pick(&self.source_url, &base.source_url),
            output_url: pick(&self.output_url, &base.output_url),
            key: pick(&self.key, &base.key),
            video_codec: pick(&self.video_codec, &base.video_codec),
            video_bitrate: pick_opt(&self.video_bitrate, &base.video_bitrate),
            video_size: pick_opt(&self.video_size, &base.video_size),
            framerate: pick_opt(&self.framerate, &base.framerate),
            gop_size: pick_opt(&self.gop_size, &base.gop_size),
            audio_codec: pick(&self.audio_codec, &base.audio_codec),
            audio_bitrate: pick(&self.audio_bitrate, &base.audio_bitrate),
        }
    }
}

/// 持久化记录: 配置 + 是否处于启用状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    #[serde(flatten)]
    pub config: StreamConfig,
    #[serde(default)]
    pub is_active: bool,
}

/// 单个推流的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    /// 探测无法完成，状态未知 (降级，不视为已退出)
    Unhealthy,
    Restarting,
    Failed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 对外返回的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub id: String,
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub retry_count: u32,
    /// 诊断信息: stderr 片段、进程表行或最后一次错误
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<StreamConfig>,
}

impl StreamStatus {
    pub fn new(id: impl Into<String>, state: StreamState) -> Self {
        Self {
            id: id.into(),
            state,
            pid: None,
            uptime_seconds: None,
            retry_count: 0,
            detail: None,
            config: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// 单个推流的运行指标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub id: String,
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    /// 常驻内存 (KB)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    /// 最近一次 ffmpeg 进度 (帧数、fps、码率、速度)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressStats>,
}

impl From<&StreamStatus> for StreamMetrics {
    fn from(status: &StreamStatus) -> Self {
        Self {
            id: status.id.clone(),
            state: status.state,
            pid: status.pid,
            uptime_seconds: status.uptime_seconds,
            retry_count: status.retry_count,
            cpu_percent: None,
            memory_kb: None,
            progress: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_applies_defaults() {
        let json = r#"{"id":"s1","sourceUrl":"A","key":"k1"}"#;
        let config: StreamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.video_codec, "copy");
        assert_eq!(config.audio_codec, "aac");
        assert_eq!(config.audio_bitrate, "128k");
        assert_eq!(config.output_url, "");
        assert!(config.is_video_copy());
    }

    #[test]
    fn test_output_target_falls_back_to_default() {
        let mut config = StreamConfig::new("s1", "A", "  ", "k1");
        assert_eq!(
            config.output_target("rtmp://localhost:1935/live/"),
            "rtmp://localhost:1935/live/k1"
        );

        config.output_url = "rtmp://x/live/".to_string();
        assert_eq!(config.output_target("unused"), "rtmp://x/live/k1");
    }

    #[test]
    fn test_patch_keeps_absent_fields() {
        let mut base = StreamConfig::new("s1", "A", "rtmp://x/live/", "k1");
        base.video_bitrate = Some("2000k".to_string());

        let patch = StreamPatch {
            source_url: Some("B".to_string()),
            video_codec: Some("libx264".to_string()),
            ..StreamPatch::default()
        };
        let merged = patch.apply(&base);

        assert_eq!(merged.id, "s1");
        assert_eq!(merged.source_url, "B");
        assert_eq!(merged.video_codec, "libx264");
        assert_eq!(merged.video_bitrate.as_deref(), Some("2000k"));
        assert_eq!(merged.key, "k1");
        assert_eq!(merged.output_url, "rtmp://x/live/");
    }

    #[test]
    fn test_record_flattens_config() {
        let record = StreamRecord {
            config: StreamConfig::new("s1", "A", "rtmp://x/live/", "k1"),
            is_active: true,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "s1");
        assert_eq!(value["sourceUrl"], "A");
        assert_eq!(value["isActive"], true);
    }
}
