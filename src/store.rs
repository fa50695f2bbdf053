//! 推流配置存储。
//!
//! 监督器从不假设内存状态是持久的，每次 Add/Stop 都会同步写入这里。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SupervisorError};
use crate::stream::{StreamConfig, StreamRecord};

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<StreamRecord>>;

    /// 新增或覆盖配置，并标记为启用
    async fn save(&self, config: &StreamConfig) -> Result<()>;

    /// 标记为停用；记录不存在时什么也不做
    async fn mark_inactive(&self, id: &str) -> Result<()>;

    async fn list_all(&self) -> Result<Vec<StreamRecord>>;
}

fn upsert(records: &mut Vec<StreamRecord>, config: &StreamConfig) {
    let record = StreamRecord {
        config: config.clone(),
        is_active: true,
    };
    match records.iter_mut().find(|r| r.config.id == config.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

fn deactivate(records: &mut [StreamRecord], id: &str) -> bool {
    match records.iter_mut().find(|r| r.config.id == id) {
        Some(record) if record.is_active => {
            record.is_active = false;
            true
        }
        _ => false,
    }
}

/// JSON 文件存储，写入时先写临时文件再重命名
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<Vec<StreamRecord>>,
}

impl JsonFileStore {
    /// 打开存储文件，不存在时从空列表开始
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} stream records from {:?}", records.len(), path);

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn flush(&self, records: &[StreamRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("Flushed {} stream records to {:?}", records.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl StreamStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<StreamRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.config.id == id).cloned())
    }

    async fn save(&self, config: &StreamConfig) -> Result<()> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        upsert(&mut updated, config);
        self.flush(&updated).await?;
        *records = updated;
        Ok(())
    }

    async fn mark_inactive(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        if deactivate(&mut updated, id) {
            self.flush(&updated).await?;
            *records = updated;
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<StreamRecord>> {
        Ok(self.records.lock().await.clone())
    }
}

/// 仅存在于内存中的存储
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StreamRecord>>,
    /// 模拟写入失败的 id
    failing: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后针对该 id 的写入都返回错误
    pub async fn fail_writes_for(&self, id: &str, reason: &str) {
        self.failing
            .lock()
            .await
            .insert(id.to_string(), reason.to_string());
    }

    async fn check_writable(&self, id: &str) -> Result<()> {
        match self.failing.lock().await.get(id) {
            Some(reason) => Err(SupervisorError::Store(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<StreamRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.config.id == id).cloned())
    }

    async fn save(&self, config: &StreamConfig) -> Result<()> {
        self.check_writable(&config.id).await?;
        upsert(&mut *self.records.lock().await, config);
        Ok(())
    }

    async fn mark_inactive(&self, id: &str) -> Result<()> {
        self.check_writable(id).await?;
        deactivate(&mut self.records.lock().await, id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<StreamRecord>> {
        Ok(self.records.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> StreamConfig {
        StreamConfig::new(id, "rtmp://src/app/in", "rtmp://x/live/", "k1")
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streams.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store.save(&config("s1")).await.unwrap();
        store.save(&config("s2")).await.unwrap();
        store.mark_inactive("s1").await.unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let records = reopened.list_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(!reopened.get("s1").await.unwrap().unwrap().is_active);
        assert!(reopened.get("s2").await.unwrap().unwrap().is_active);
        assert!(reopened.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_and_reactivates() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("streams.json"))
            .await
            .unwrap();

        store.save(&config("s1")).await.unwrap();
        store.mark_inactive("s1").await.unwrap();

        let mut changed = config("s1");
        changed.key = "k2".to_string();
        store.save(&changed).await.unwrap();

        let records = store.list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_active);
        assert_eq!(records[0].config.key, "k2");
    }

    #[tokio::test]
    async fn test_mark_inactive_unknown_id_is_noop() {
        let store = MemoryStore::new();
        store.mark_inactive("ghost").await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryStore::new();
        store.fail_writes_for("s1", "disk full").await;
        assert!(matches!(
            store.save(&config("s1")).await,
            Err(SupervisorError::Store(_))
        ));
        store.save(&config("s2")).await.unwrap();
    }
}
