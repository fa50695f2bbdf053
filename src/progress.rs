//! ffmpeg 进度输出解析。
//!
//! 开启 `-progress pipe:1` 后，ffmpeg 周期性地向 stdout 写出一组 `key=value` 行，
//! 每组以 `progress=continue` (结束时为 `progress=end`) 收尾:
//!
//! ```text
//! frame=250
//! fps=25.00
//! bitrate=2097.2kbits/s
//! total_size=1310720
//! out_time=00:00:10.000000
//! speed=1.00x
//! progress=continue
//! ```

use serde::Serialize;

/// 一个完整进度块里的统计值，`N/A` 记为 `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressStats {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// kbit/s
    pub bitrate_kbps: Option<f64>,
    /// 已输出字节数
    pub total_size: Option<u64>,
    /// 已输出的媒体时长 (秒)
    pub out_time_secs: Option<f64>,
    /// 处理速度倍率 (1.0 表示实时)
    pub speed: Option<f64>,
    pub dup_frames: Option<u64>,
    pub drop_frames: Option<u64>,
}

/// 解析 `HH:MM:SS.micro` 为秒
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    match value.trim() {
        "" | "N/A" => None,
        v => v.parse().ok(),
    }
}

impl ProgressStats {
    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "frame" => self.frame = parse_number(value),
            "fps" => self.fps = parse_number(value),
            "bitrate" => self.bitrate_kbps = parse_number(value.trim().trim_end_matches("kbits/s")),
            "total_size" => self.total_size = parse_number(value),
            "out_time" => self.out_time_secs = parse_time(value),
            "speed" => self.speed = parse_number(value.trim().trim_end_matches('x')),
            "dup_frames" => self.dup_frames = parse_number(value),
            "drop_frames" => self.drop_frames = parse_number(value),
            _ => {}
        }
    }
}

/// 取最后一个完整的进度块
///
/// 缓冲区开头可能是被截断的半个块，只有以 `progress=` 结尾的块才算完整。
pub fn parse_latest(text: &str) -> Option<ProgressStats> {
    let mut latest = None;
    let mut current = ProgressStats::default();

    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        if key == "progress" {
            latest = Some(std::mem::take(&mut current));
        } else {
            current.apply(key, value);
        }
    }

    latest
}
