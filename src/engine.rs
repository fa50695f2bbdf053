//! 外部转推进程 (ffmpeg) 的启动、停止与存活探测。

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::progress::{self, ProgressStats};
use crate::stream::StreamConfig;

/// 输出尾部缓冲上限
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// 启动前要求的最低可用内存 (KB)
const MIN_AVAILABLE_MEMORY_KB: u64 = 5120;

/// 等待 stderr 读取任务收尾的时间
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 进程输出的环形缓冲，只保留最近的数据
#[derive(Clone, Default)]
pub struct OutputTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
}

impl OutputTail {
    pub fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.extend(bytes);
        let overflow = buf.len().saturating_sub(OUTPUT_TAIL_BYTES);
        buf.drain(..overflow);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().copied().collect()
    }

    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).trim().to_string()
    }
}

/// 一个转推进程实例
///
/// 句柄独占子进程：被丢弃时子进程会被杀掉 (`kill_on_drop`)，
/// stderr 与进度读取任务会被中止。
pub struct ProcessHandle {
    pid: u32,
    program: String,
    child: Option<Child>,
    stderr: OutputTail,
    reader: Option<JoinHandle<()>>,
    /// `-progress pipe:1` 写到 stdout 的进度块
    progress: OutputTail,
    progress_reader: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    fn spawned(mut child: Child, program: String) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Io(std::io::Error::other("child exited before pid was read")))?;
        let stderr = OutputTail::default();
        let reader = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_into_tail(pipe, stderr.clone(), "stderr")));
        let progress = OutputTail::default();
        let progress_reader = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_into_tail(pipe, progress.clone(), "progress")));

        Ok(Self {
            pid,
            program,
            child: Some(child),
            stderr,
            reader,
            progress,
            progress_reader,
        })
    }

    /// 由其他方式管理的进程 (不持有子进程对象)
    pub fn external(pid: u32, program: impl Into<String>) -> Self {
        Self {
            pid,
            program: program.into(),
            child: None,
            stderr: OutputTail::default(),
            reader: None,
            progress: OutputTail::default(),
            progress_reader: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            program: self.program.clone(),
        }
    }

    pub fn recent_stderr(&self) -> Vec<u8> {
        self.stderr.snapshot()
    }

    pub fn recent_progress(&self) -> Vec<u8> {
        self.progress.snapshot()
    }

    /// 等待 stderr 读取任务把管道里剩余的数据读完 (有上限)
    async fn drain_stderr(&mut self) {
        if let Some(reader) = self.reader.take() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        for reader in [self.reader.take(), self.progress_reader.take()].into_iter().flatten() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .finish()
    }
}

async fn read_into_tail<R: AsyncRead + Unpin>(mut pipe: R, tail: OutputTail, label: &'static str) {
    let mut chunk = [0u8; 1024];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push(&chunk[..n]),
            Err(e) => {
                debug!("{} reader stopped: {}", label, e);
                break;
            }
        }
    }
}

/// 进程身份，用于进程表探测 (不持有子进程)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub program: String,
}

/// 进程表探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// PID 存在且确实是预期的程序
    Confirmed { command_line: String },
    /// PID 被其他程序复用
    Foreign { command_line: String },
    /// 进程表中没有该 PID
    Missing,
}

/// 进程资源占用 (来自 `ps`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub memory_kb: u64,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// 启动进程，并在宽限期后确认它仍在运行
    async fn start(&self, config: &StreamConfig) -> Result<ProcessHandle>;

    /// SIGTERM，超时后 SIGKILL。超时返回 `StopTimeout`，但进程已被回收
    async fn stop(&self, handle: ProcessHandle, timeout: Duration) -> Result<()>;

    /// 非阻塞的存活检查
    fn is_alive(&self, handle: &mut ProcessHandle) -> bool;

    fn read_recent_stderr(&self, handle: &ProcessHandle) -> Vec<u8> {
        handle.recent_stderr()
    }

    /// 最近一个完整的进度块
    fn read_progress(&self, handle: &ProcessHandle) -> Option<ProgressStats> {
        progress::parse_latest(&String::from_utf8_lossy(&handle.recent_progress()))
    }

    /// 查询系统进程表，确认 PID 对应的仍是预期程序
    async fn probe(&self, process: &ProcessIdentity) -> Result<ProbeOutcome>;

    /// CPU 与内存占用，进程不存在时返回 `None`
    async fn usage(&self, process: &ProcessIdentity) -> Result<Option<ProcessUsage>>;
}

/// 按固定顺序构建 ffmpeg 参数
pub fn build_args(config: &StreamConfig, default_output_url: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-v".into(),
        "warning".into(),
        "-i".into(),
        config.source_url.clone(),
        "-c:v".into(),
        config.video_codec.clone(),
    ];

    // 仅在转码时追加视频参数
    if !config.is_video_copy() {
        if let Some(size) = config.video_size.as_ref().filter(|s| *s != "copy") {
            args.extend(["-s".into(), size.clone()]);
        }
        if let Some(bitrate) = &config.video_bitrate {
            args.extend(["-b:v".into(), bitrate.clone()]);
        }
        if let Some(rate) = config.framerate.as_ref().filter(|r| *r != "copy") {
            args.extend(["-r".into(), rate.clone()]);
        }
        if let Some(gop) = &config.gop_size {
            args.extend(["-g".into(), gop.clone()]);
        }
    }

    args.extend([
        "-c:a".into(),
        config.audio_codec.clone(),
        "-b:a".into(),
        config.audio_bitrate.clone(),
        "-f".into(),
        "flv".into(),
        config.output_target(default_output_url),
    ]);

    args
}

pub struct FfmpegRunner {
    binary: String,
    default_output_url: String,
    startup_grace: Duration,
    /// 是否让 ffmpeg 把进度写到 stdout
    progress: bool,
}

impl FfmpegRunner {
    pub fn new(
        binary: impl Into<String>,
        default_output_url: impl Into<String>,
        startup_grace: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            default_output_url: default_output_url.into(),
            startup_grace,
            progress: false,
        }
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// 实际的启动参数: 开启进度时在日志级别之后插入 `-progress pipe:1`
    fn launch_args(&self, config: &StreamConfig) -> Vec<String> {
        let mut args = build_args(config, &self.default_output_url);
        if self.progress {
            args.splice(3..3, ["-progress".to_string(), "pipe:1".to_string()]);
        }
        args
    }

    async fn ps(&self, pid: u32, format: &str) -> Result<String> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", format])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            Ok(Err(e)) => Err(SupervisorError::ProbeFailed {
                pid,
                reason: e.to_string(),
            }),
            Err(_) => Err(SupervisorError::ProbeFailed {
                pid,
                reason: "ps timed out".to_string(),
            }),
        }
    }

    /// 进程表中用于比对的程序名
    fn program_name(&self) -> String {
        Path::new(&self.binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.clone())
    }

    fn check_memory(id: &str) -> Result<()> {
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < MIN_AVAILABLE_MEMORY_KB => Err(SupervisorError::launch_failed(
                id,
                format!("insufficient system memory ({} KB available)", mem.avail),
                "",
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                // 无法获取内存信息时只记录警告，不阻断启动
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for FfmpegRunner {
    async fn start(&self, config: &StreamConfig) -> Result<ProcessHandle> {
        // 1. 检查系统内存
        Self::check_memory(&config.id)?;

        // 2. 构建命令
        let args = self.launch_args(config);
        info!(
            stream_id = %config.id,
            "Starting relay: {} {}",
            self.binary,
            args.join(" ")
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(if self.progress {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // 3. 启动子进程
        let child = cmd.spawn().map_err(|e| {
            error!(stream_id = %config.id, "Failed to spawn {}: {}", self.binary, e);
            SupervisorError::launch_failed(&config.id, format!("spawn failed: {}", e), "")
        })?;
        let mut handle = ProcessHandle::spawned(child, self.program_name())?;

        // 4. 宽限期后再确认一次，很多错误 (地址、鉴权、编码) 要在首次 IO 后才暴露
        tokio::time::sleep(self.startup_grace).await;
        if !self.is_alive(&mut handle) {
            handle.drain_stderr().await;
            let stderr = handle.stderr.to_text();
            let status = handle
                .child
                .as_mut()
                .and_then(|c| c.try_wait().ok().flatten())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            error!(stream_id = %config.id, "Relay exited during startup ({}): {}", status, stderr);
            return Err(SupervisorError::launch_failed(
                &config.id,
                format!("process exited during startup ({})", status),
                stderr,
            ));
        }

        info!(stream_id = %config.id, pid = handle.pid, "Relay process is running");
        Ok(handle)
    }

    async fn stop(&self, mut handle: ProcessHandle, timeout: Duration) -> Result<()> {
        let pid = handle.pid;
        let Some(child) = handle.child.as_mut() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid, "Process already exited with {}", status);
            handle.drain_stderr().await;
            return Ok(());
        }

        // 先尝试正常终止
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, "Failed to send SIGTERM: {}", e);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let result = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, "Process terminated with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(SupervisorError::Io(e)),
            Err(_) => {
                // 超时，强制结束
                warn!(pid, "Process did not exit within {:?}, killing", timeout);
                child.kill().await?;
                Err(SupervisorError::StopTimeout { pid })
            }
        };

        handle.drain_stderr().await;
        result
    }

    fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        let pid = handle.pid;
        match handle.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) => false,
                Err(e) => {
                    // 无法判断时交给进程表探测
                    warn!(pid, "try_wait failed: {}", e);
                    true
                }
            },
            None => false,
        }
    }

    async fn probe(&self, process: &ProcessIdentity) -> Result<ProbeOutcome> {
        let command_line = self.ps(process.pid, "args=").await?;
        if command_line.is_empty() {
            return Ok(ProbeOutcome::Missing);
        }
        if command_line.contains(&process.program) {
            Ok(ProbeOutcome::Confirmed { command_line })
        } else {
            Ok(ProbeOutcome::Foreign { command_line })
        }
    }

    async fn usage(&self, process: &ProcessIdentity) -> Result<Option<ProcessUsage>> {
        let line = self.ps(process.pid, "%cpu=,rss=").await?;
        Ok(parse_usage(&line))
    }
}

/// 解析 `ps -o %cpu=,rss=` 的一行输出
fn parse_usage(line: &str) -> Option<ProcessUsage> {
    let mut fields = line.split_whitespace();
    let cpu_percent = fields.next()?.parse().ok()?;
    let memory_kb = fields.next()?.parse().ok()?;
    Some(ProcessUsage {
        cpu_percent,
        memory_kb,
    })
}
