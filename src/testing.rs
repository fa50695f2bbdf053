//! 测试用的假进程管理器。

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::{ProbeOutcome, ProcessHandle, ProcessIdentity, ProcessRunner, ProcessUsage};
use crate::error::{Result, SupervisorError};
use crate::progress::{self, ProgressStats};
use crate::stream::StreamConfig;

#[derive(Default)]
pub struct FakeRunner {
    next_pid: AtomicU32,
    /// 存活的 pid -> 流 id
    alive: Mutex<HashMap<u32, String>>,
    /// 所有启动过的 pid -> 流 id
    spawned: Mutex<HashMap<u32, String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    starts: Mutex<Vec<(String, Instant)>>,
    stopped: Mutex<Vec<u32>>,
    launched_configs: Mutex<Vec<StreamConfig>>,
    probes: AtomicUsize,
    probe_error: AtomicBool,
    /// 被其他程序复用的 pid
    foreign: Mutex<HashSet<u32>>,
    /// 流 id -> 进度输出
    progress: Mutex<HashMap<String, String>>,
    start_delay: Mutex<Duration>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    pub fn fail_starts(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn allow_starts(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn panic_on_probe(&self, id: &str) {
        self.panicking.lock().unwrap().insert(id.to_string());
    }

    pub fn set_probe_error(&self, fail: bool) {
        self.probe_error.store(fail, Ordering::SeqCst);
    }

    /// 模拟 PID 复用: 进程仍"存活"，但进程表里是另一个程序
    pub fn reuse_pid(&self, pid: u32) {
        self.foreign.lock().unwrap().insert(pid);
    }

    pub fn set_progress(&self, id: &str, output: &str) {
        self.progress
            .lock()
            .unwrap()
            .insert(id.to_string(), output.to_string());
    }

    /// 每次启动耗时 (模拟启动宽限期)
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    fn owner(&self, pid: u32) -> Option<String> {
        self.spawned.lock().unwrap().get(&pid).cloned()
    }

    /// 模拟进程在外部退出
    pub fn kill(&self, id: &str) {
        self.alive.lock().unwrap().retain(|_, owner| owner != id);
    }

    pub fn live_processes(&self, id: &str) -> usize {
        self.alive
            .lock()
            .unwrap()
            .values()
            .filter(|owner| *owner == id)
            .count()
    }

    pub fn start_times(&self, id: &str) -> Vec<Instant> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| owner == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn starts(&self, id: &str) -> usize {
        self.start_times(id).len()
    }

    pub fn stopped(&self) -> Vec<u32> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn last_config(&self, id: &str) -> Option<StreamConfig> {
        self.launched_configs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn start(&self, config: &StreamConfig) -> Result<ProcessHandle> {
        self.starts
            .lock()
            .unwrap()
            .push((config.id.clone(), Instant::now()));

        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&config.id) {
            return Err(SupervisorError::launch_failed(
                &config.id,
                "process exited during startup (exit status: 1)",
                "rtmp://src: Connection refused",
            ));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid, config.id.clone());
        self.spawned.lock().unwrap().insert(pid, config.id.clone());
        self.launched_configs.lock().unwrap().push(config.clone());
        Ok(ProcessHandle::external(pid, "ffmpeg"))
    }

    async fn stop(&self, handle: ProcessHandle, _timeout: Duration) -> Result<()> {
        self.alive.lock().unwrap().remove(&handle.pid());
        self.stopped.lock().unwrap().push(handle.pid());
        Ok(())
    }

    fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        self.alive.lock().unwrap().contains_key(&handle.pid())
    }

    async fn probe(&self, process: &ProcessIdentity) -> Result<ProbeOutcome> {
        self.probes.fetch_add(1, Ordering::SeqCst);

        if let Some(owner) = self.owner(process.pid) {
            if self.panicking.lock().unwrap().contains(&owner) {
                panic!("probe exploded for {}", owner);
            }
        }
        if self.probe_error.load(Ordering::SeqCst) {
            return Err(SupervisorError::ProbeFailed {
                pid: process.pid,
                reason: "ps: command not found".to_string(),
            });
        }

        if self.foreign.lock().unwrap().contains(&process.pid) {
            return Ok(ProbeOutcome::Foreign {
                command_line: "/usr/sbin/sshd -D".to_string(),
            });
        }
        if self.alive.lock().unwrap().contains_key(&process.pid) {
            Ok(ProbeOutcome::Confirmed {
                command_line: format!("ffmpeg -y -v warning (pid {})", process.pid),
            })
        } else {
            Ok(ProbeOutcome::Missing)
        }
    }

    fn read_progress(&self, handle: &ProcessHandle) -> Option<ProgressStats> {
        let owner = self.owner(handle.pid())?;
        let output = self.progress.lock().unwrap().get(&owner).cloned()?;
        progress::parse_latest(&output)
    }

    async fn usage(&self, process: &ProcessIdentity) -> Result<Option<ProcessUsage>> {
        if !self.alive.lock().unwrap().contains_key(&process.pid) {
            return Ok(None);
        }
        Ok(Some(ProcessUsage {
            cpu_percent: 3.5,
            memory_kb: 20480,
        }))
    }
}
