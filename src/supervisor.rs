//! 推流监督器。
//!
//! 持有 `流 id -> 运行时句柄` 注册表，负责启动、停止、更新、重启以及状态查询。
//! 同一个 id 上的生命周期操作通过每个 id 独立的异步锁串行化，不同 id 之间互不阻塞；
//! 注册表本身只在读写映射时短暂加锁，不会跨越 `.await`。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::cache::StatusCache;
use crate::clock::Clock;
use crate::config::{AppConfig, RestartPolicy};
use crate::engine::{ProbeOutcome, ProcessHandle, ProcessIdentity, ProcessRunner};
use crate::error::{Result, SupervisorError};
use crate::state::StreamRuntime;
use crate::store::StreamStore;
use crate::stream::{
    StreamConfig, StreamMetrics, StreamPatch, StreamRecord, StreamState, StreamStatus,
};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// SIGTERM 后等待多久再 SIGKILL
    pub stop_timeout: Duration,
    pub cache_ttl: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            cache_ttl: crate::cache::DEFAULT_TTL,
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stop_timeout: config.server.stop_timeout(),
            cache_ttl: config.server.status_cache_ttl(),
            restart: config.restart.clone(),
        }
    }
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// 某个 id 的生命周期锁
///
/// 释放时如果没有其他调用方持有或等待同一把锁，就把它从锁表中移除，
/// 锁表大小只取决于正在进行的操作数量。
struct IdGuard<'a> {
    locks: &'a LockMap,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// 注册表中一个 id 的检查结果 (在锁外处理)
enum Liveness {
    Absent,
    /// 上次重启失败，正在等待下一次重试
    Waiting { due: bool, status: StreamStatus },
    Exited,
    Alive { process: ProcessIdentity },
}

pub struct Supervisor {
    runner: Arc<dyn ProcessRunner>,
    store: Arc<dyn StreamStore>,
    clock: Arc<dyn Clock>,
    cache: StatusCache,
    options: SupervisorOptions,
    /// 活跃流表 (Stream Id -> Runtime)
    registry: Mutex<HashMap<String, StreamRuntime>>,
    /// 每个 id 的生命周期锁 (只保留正在使用的)
    locks: LockMap,
    /// 最终失败的流 (Stream Id -> 最后一次错误)
    failures: Mutex<HashMap<String, String>>,
}

impl Supervisor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn StreamStore>,
        clock: Arc<dyn Clock>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            runner,
            store,
            cache: StatusCache::new(options.cache_ttl, clock.clone()),
            clock,
            options,
            registry: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, StreamRuntime>> {
        // 健康检查任务 panic 可能导致锁中毒，数据本身仍然一致
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn lock_id(&self, id: &str) -> IdGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// 当前注册表中所有 id 的快照
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.registry().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    /// 不加锁、不探测的状态快照 (用于列表展示)
    pub fn current_state(&self, id: &str) -> StreamState {
        let live = self.registry().get(id).map(|runtime| runtime.state);
        match live {
            Some(state) => state,
            None if self.failures().contains_key(id) => StreamState::Failed,
            None => StreamState::Stopped,
        }
    }

    /// 新增并启动一个推流
    ///
    /// # 错误处理
    /// - id 已在运行时返回 `AlreadyExists`
    /// - 配置写入失败时返回 `PersistenceFailed`，此时不会启动进程
    /// - 进程启动失败时返回 `LaunchFailed`，注册表中不会留下句柄
    pub async fn add(&self, config: StreamConfig) -> Result<StreamStatus> {
        let _guard = self.lock_id(&config.id).await;
        self.add_locked(config).await
    }

    async fn add_locked(&self, config: StreamConfig) -> Result<StreamStatus> {
        let id = config.id.clone();

        // 1. 检查是否已经在运行
        let exists = self.registry().contains_key(&id);
        if exists {
            return Err(SupervisorError::AlreadyExists(id));
        }

        // 2. 先持久化，避免出现未记录的孤儿进程
        if let Err(e) = self.store.save(&config).await {
            error!(stream_id = %id, "Failed to persist stream config: {}", e);
            return Err(SupervisorError::persistence(&id, e));
        }

        // 3. 登记占位记录后启动进程
        let launch_config = config.clone();
        self.registry()
            .insert(id.clone(), StreamRuntime::starting(config, self.clock.now()));

        let process = match self.runner.start(&launch_config).await {
            Ok(process) => process,
            Err(e) => {
                error!(stream_id = %id, "Stream failed to start: {}", e);
                self.registry().remove(&id);
                self.failures().insert(id.clone(), failure_text(&e));
                self.cache.invalidate(&id);
                if let Err(store_err) = self.store.mark_inactive(&id).await {
                    warn!(stream_id = %id, "Failed to mark stream inactive: {}", store_err);
                }
                return Err(e);
            }
        };

        // 4. 登记运行时状态
        let now = self.clock.now();
        let pid = process.pid();
        let runtime = StreamRuntime::running(launch_config, process, now);
        let status = runtime.status(now);
        self.registry().insert(id.clone(), runtime);
        self.failures().remove(&id);
        self.cache.put(&id, status.clone());

        info!(stream_id = %id, pid, "Stream started");
        Ok(status)
    }

    /// 停止推流并标记为停用
    ///
    /// 已经最终失败的流也可以停止: 清除失败记录，之后状态为 `Stopped`。
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<()> {
        let runtime = self.registry().remove(id);
        let failed = self.failures().remove(id).is_some();
        self.cache.invalidate(id);

        match runtime {
            Some(mut runtime) => {
                if let Some(process) = runtime.process.take() {
                    self.terminate(id, process).await;
                }
            }
            None if failed => debug!(stream_id = %id, "Clearing failed stream"),
            None => return Err(SupervisorError::NotFound(id.to_string())),
        }

        self.store
            .mark_inactive(id)
            .await
            .map_err(|e| SupervisorError::persistence(id, e))?;

        info!(stream_id = %id, "Stream stopped");
        Ok(())
    }

    /// 用合并后的配置重新启动推流，缺省字段沿用旧值
    pub async fn update(&self, id: &str, patch: StreamPatch) -> Result<StreamStatus> {
        let _guard = self.lock_id(id).await;

        let base = self.last_known_config(id).await?;
        match self.stop_locked(id).await {
            Ok(()) | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let merged = patch.apply(&base);
        info!(stream_id = %id, "Updating stream config");
        self.add_locked(merged).await
    }

    /// 使用最后已知的配置重启推流
    pub async fn restart(&self, id: &str) -> Result<StreamStatus> {
        let _guard = self.lock_id(id).await;

        let config = self.last_known_config(id).await?;
        match self.stop_locked(id).await {
            Ok(()) | Err(SupervisorError::NotFound(_)) => {}
            Err(e) => warn!(stream_id = %id, "Stop before restart failed: {}", e),
        }

        info!(stream_id = %id, "Restarting stream");
        self.add_locked(config).await
    }

    /// 查询推流状态
    ///
    /// 进程已退出时会同步触发重启，并在本次调用中返回 `Restarting`，
    /// 轮询方不会看到一个悄无声息死掉的流。
    pub async fn status(&self, id: &str) -> Result<StreamStatus> {
        let _guard = self.lock_id(id).await;
        self.status_locked(id).await
    }

    async fn status_locked(&self, id: &str) -> Result<StreamStatus> {
        let now = self.clock.now();

        // 1. 非阻塞检查 (只在映射锁内做 try_wait)
        let liveness = {
            let mut registry = self.registry();
            match registry.get_mut(id) {
                None => Liveness::Absent,
                Some(runtime) => {
                    let status = runtime.status(now);
                    let due = runtime.retry_due(now);
                    match runtime.process.as_mut() {
                        None => Liveness::Waiting { due, status },
                        Some(process) => {
                            if self.runner.is_alive(process) {
                                Liveness::Alive {
                                    process: process.identity(),
                                }
                            } else {
                                Liveness::Exited
                            }
                        }
                    }
                }
            }
        };

        match liveness {
            Liveness::Absent => self.detached_status(id).await,
            Liveness::Waiting { due: false, status } => Ok(status),
            Liveness::Waiting { due: true, .. } => Ok(self.self_heal(id, None).await),
            Liveness::Exited => {
                warn!(stream_id = %id, "Stream is not running, attempting restart");
                Ok(self.self_heal(id, Some("process exited")).await)
            }
            Liveness::Alive { process } => {
                // 2. 缓存只用来省掉进程表探测
                if let Some(cached) = self.cache.get(id) {
                    return Ok(cached);
                }

                // 3. 进程表探测，防止 PID 复用
                match self.runner.probe(&process).await {
                    Ok(ProbeOutcome::Confirmed { command_line }) => {
                        let status = self
                            .mark_state(id, StreamState::Running, now)
                            .map(|s| s.with_detail(command_line));
                        match status {
                            Some(status) => {
                                self.cache.put(id, status.clone());
                                Ok(status)
                            }
                            None => self.detached_status(id).await,
                        }
                    }
                    Ok(ProbeOutcome::Foreign { command_line }) => {
                        warn!(
                            stream_id = %id,
                            pid = process.pid,
                            "PID now belongs to another program: {}",
                            command_line
                        );
                        Ok(self.self_heal(id, Some("pid reused by another program")).await)
                    }
                    Ok(ProbeOutcome::Missing) => {
                        warn!(stream_id = %id, pid = process.pid, "Process missing from process table");
                        Ok(self.self_heal(id, Some("process missing from process table")).await)
                    }
                    Err(e) => {
                        // 探测失败视为状态未知，而不是进程已退出
                        warn!(stream_id = %id, "Liveness probe failed: {}", e);
                        match self.mark_state(id, StreamState::Unhealthy, now) {
                            Some(status) => Ok(status.with_detail(e.to_string())),
                            None => self.detached_status(id).await,
                        }
                    }
                }
            }
        }
    }

    fn mark_state(
        &self,
        id: &str,
        state: StreamState,
        now: tokio::time::Instant,
    ) -> Option<StreamStatus> {
        let mut registry = self.registry();
        let runtime = registry.get_mut(id)?;
        runtime.state = state;
        Some(runtime.status(now))
    }

    /// 不在注册表中的流: 最终失败、已停止或不存在
    async fn detached_status(&self, id: &str) -> Result<StreamStatus> {
        let failure = self.failures().get(id).cloned();
        let record = self.store.get(id).await?;

        match (failure, record) {
            (Some(error), record) => {
                let status = StreamStatus::new(id, StreamState::Failed).with_detail(error);
                Ok(match record {
                    Some(r) => status.with_config(r.config),
                    None => status,
                })
            }
            (None, Some(record)) => {
                Ok(StreamStatus::new(id, StreamState::Stopped).with_config(record.config))
            }
            (None, None) => Err(SupervisorError::NotFound(id.to_string())),
        }
    }

    /// 自愈: 回收旧进程，用原配置重新拉起
    ///
    /// 总是返回 `Restarting`。失败时按重启策略计数并退避，
    /// 用尽次数后移除句柄，流进入 `Failed`。
    async fn self_heal(&self, id: &str, reason: Option<&str>) -> StreamStatus {
        // 1. 取出旧进程与配置
        let taken = {
            let mut registry = self.registry();
            registry.get_mut(id).map(|runtime| {
                runtime.state = StreamState::Restarting;
                (runtime.config.clone(), runtime.process.take())
            })
        };
        let Some((config, old)) = taken else {
            return StreamStatus::new(id, StreamState::Stopped);
        };
        self.cache.invalidate(id);

        let mut cause = reason.map(str::to_string);
        if let Some(process) = old {
            let stderr = String::from_utf8_lossy(&self.runner.read_recent_stderr(&process))
                .trim()
                .to_string();
            if !stderr.is_empty() {
                warn!(stream_id = %id, "Last stderr output: {}", stderr);
                cause = Some(format!("{}: {}", cause.unwrap_or_default(), stderr));
            }
            self.terminate(id, process).await;
        }

        // 2. 重新启动
        let result = self.runner.start(&config).await;
        let now = self.clock.now();
        let (status, gave_up) = {
            let mut registry = self.registry();
            let Some(runtime) = registry.get_mut(id) else {
                // 持有 id 锁期间句柄不会被移除
                return StreamStatus::new(id, StreamState::Stopped);
            };

            match result {
                Ok(process) => {
                    info!(stream_id = %id, pid = process.pid(), "Stream restarted");
                    runtime.process = Some(process);
                    runtime.started_at = now;
                    runtime.state = StreamState::Running;
                    runtime.retry_count = 0;
                    runtime.next_retry_at = None;
                    runtime.last_error = cause;

                    let mut status = runtime.status(now);
                    status.state = StreamState::Restarting;
                    (status, None)
                }
                Err(e) => {
                    runtime.retry_count += 1;
                    runtime.last_error = Some(failure_text(&e));
                    runtime.state = StreamState::Restarting;
                    let failures = runtime.retry_count;
                    let policy = &self.options.restart;

                    if policy.exhausted(failures) {
                        error!(
                            stream_id = %id,
                            "Stream reached max restart attempts ({}). Giving up: {}",
                            policy.max_attempts, e
                        );
                        let status = runtime.status(now);
                        registry.remove(id);
                        (status, Some(failure_text(&e)))
                    } else {
                        // 退避从本次启动失败之后开始计算
                        let backoff = policy.backoff(failures);
                        runtime.next_retry_at = Some(now + backoff);
                        warn!(
                            stream_id = %id,
                            "Restart failed. Retry {}/{}. Backing off for {:?}: {}",
                            failures, policy.max_attempts, backoff, e
                        );
                        (runtime.status(now), None)
                    }
                }
            }
        };

        // 3. 放弃重启: 记录失败并停用，下次启动时不再恢复
        if let Some(error) = gave_up {
            self.failures().insert(id.to_string(), error);
            if let Err(e) = self.store.mark_inactive(id).await {
                warn!(stream_id = %id, "Failed to mark stream inactive: {}", e);
            }
        }

        status
    }

    async fn terminate(&self, id: &str, process: ProcessHandle) {
        let pid = process.pid();
        match self.runner.stop(process, self.options.stop_timeout).await {
            Ok(()) => debug!(stream_id = %id, pid, "Process terminated"),
            Err(SupervisorError::StopTimeout { .. }) => {
                warn!(stream_id = %id, pid, "Process ignored SIGTERM and was killed")
            }
            Err(e) => error!(stream_id = %id, pid, "Error stopping process: {}", e),
        }
    }

    async fn last_known_config(&self, id: &str) -> Result<StreamConfig> {
        let live = self.registry().get(id).map(|r| r.config.clone());
        if let Some(config) = live {
            return Ok(config);
        }
        self.store
            .get(id)
            .await?
            .map(|record| record.config)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// 失败后按 2^n 秒指数退避重试，返回最后一次的错误
    pub async fn add_with_retry(
        &self,
        config: StreamConfig,
        max_retries: u32,
    ) -> Result<StreamStatus> {
        let mut last_error = None;

        for attempt in 0..max_retries {
            match self.add(config.clone()).await {
                Ok(status) => return Ok(status),
                Err(e @ SupervisorError::AlreadyExists(_)) => return Err(e),
                Err(e) => {
                    let delay = Duration::from_secs(2u64.pow(attempt));
                    warn!(
                        stream_id = %config.id,
                        "Attempt {}/{} failed: {}. Waiting {:?}",
                        attempt + 1,
                        max_retries,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SupervisorError::launch_failed(&config.id, "no start attempts were made", "")
        }))
    }

    /// 运行指标: 状态、运行时长、进程资源占用与 ffmpeg 进度
    ///
    /// 只读查询，不会触发重启。资源查询失败只记录警告。
    pub async fn metrics(&self, id: &str) -> Result<StreamMetrics> {
        let _guard = self.lock_id(id).await;
        let now = self.clock.now();

        let snapshot = {
            let registry = self.registry();
            registry.get(id).map(|runtime| {
                let process = runtime.process.as_ref();
                (
                    runtime.status(now),
                    process.map(ProcessHandle::identity),
                    process.and_then(|p| self.runner.read_progress(p)),
                )
            })
        };
        let Some((status, identity, progress)) = snapshot else {
            let status = self.detached_status(id).await?;
            return Ok(StreamMetrics::from(&status));
        };

        let mut metrics = StreamMetrics::from(&status);
        metrics.progress = progress;
        if let Some(process) = identity {
            match self.runner.usage(&process).await {
                Ok(Some(usage)) => {
                    metrics.cpu_percent = Some(usage.cpu_percent);
                    metrics.memory_kb = Some(usage.memory_kb);
                }
                Ok(None) => {}
                Err(e) => warn!(stream_id = %id, "Failed to read process usage: {}", e),
            }
        }

        Ok(metrics)
    }

    /// 所有持久化的推流配置 (包括未运行的)
    pub async fn list_all(&self) -> Result<Vec<StreamRecord>> {
        self.store.list_all().await
    }

    /// 批量导入，逐个启动并返回每个 id 的结果
    pub async fn add_batch(
        &self,
        configs: Vec<StreamConfig>,
    ) -> Vec<(String, Result<StreamStatus>)> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            let id = config.id.clone();
            let result = self.add(config).await;
            results.push((id, result));
        }
        results
    }

    /// 启动时恢复所有标记为启用的推流，返回成功启动的数量
    pub async fn resume_active(&self) -> Result<usize> {
        let records = self.store.list_all().await?;
        let mut started = 0;

        for record in records.into_iter().filter(|r| r.is_active) {
            let id = record.config.id.clone();
            if self.is_live(&id) {
                continue;
            }
            match self.add(record.config).await {
                Ok(_) => started += 1,
                Err(e) => error!(stream_id = %id, "Failed to resume stream: {}", e),
            }
        }

        info!("Resumed {} active streams", started);
        Ok(started)
    }

    /// 终止并回收所有进程，不修改持久化状态 (下次启动时恢复)
    pub async fn shutdown(&self) {
        for id in self.active_ids() {
            let _guard = self.lock_id(&id).await;
            let runtime = self.registry().remove(&id);
            if let Some(process) = runtime.and_then(|mut r| r.process.take()) {
                self.terminate(&id, process).await;
            }
            self.cache.invalidate(&id);
        }
        info!("Supervisor shut down");
    }
}

fn failure_text(err: &SupervisorError) -> String {
    match err.diagnostic() {
        Some(stderr) => format!("{}\n{}", err, stderr),
        None => err.to_string(),
    }
}
