//! 推流状态缓存。
//!
//! 条目只做参考，进程是否存活以注册表为准。过期条目在读取时惰性删除，
//! 没有后台清理任务。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::stream::StreamStatus;

/// 默认缓存时间 (5 分钟)
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    status: StreamStatus,
    stored_at: Instant,
}

pub struct StatusCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl StatusCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn get(&self, id: &str) -> Option<StreamStatus> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let fresh = entries
            .get(id)
            .map(|entry| now.duration_since(entry.stored_at) <= self.ttl)?;
        if !fresh {
            entries.remove(id);
            return None;
        }
        entries.get(id).map(|entry| entry.status.clone())
    }

    pub fn put(&self, id: &str, status: StreamStatus) {
        let stored_at = self.clock.now();
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), CacheEntry { status, stored_at });
    }

    pub fn invalidate(&self, id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
