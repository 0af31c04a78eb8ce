//! Upload session cache / 上传会话缓存
//!
//! Bridges stateless per-chunk calls into one logical upload. Entries use a
//! sliding TTL so abandoned uploads fall out on their own. Chunks for one
//! upload are assumed sequential; concurrent writers to the same key are
//! undefined behaviour.

use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Default sliding expiration for an upload session / 默认过期时间
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Receipt of one uploaded part / 分片回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
}

/// Provider-side state of an in-flight upload / 上传会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSession {
    /// S3 multipart upload handle plus ordered part receipts
    Multipart {
        upload_id: String,
        key: String,
        parts: Vec<PartReceipt>,
    },
    /// Write cursor for providers with positional writes
    Positional { offset: u64 },
}

/// get/set/remove-with-TTL cache consumed by the drivers / 会话缓存接口
pub trait SessionCache: Send + Sync {
    fn get(&self, key: &str) -> Option<UploadSession>;

    fn set(&self, key: &str, session: UploadSession, ttl: Duration);

    fn remove(&self, key: &str);
}

/// Session key namespaced per driver / 按驱动区分的会话键
pub fn session_key(driver_id: &str, upload_uid: &str) -> String {
    format!("{}:{}", driver_id, upload_uid)
}

#[derive(Clone)]
struct CacheEntry {
    session: UploadSession,
    ttl: Duration,
}

/// Every write and read restarts the entry's own TTL / 滑动过期
struct SlidingExpiry;

impl Expiry<String, CacheEntry> for SlidingExpiry {
    fn expire_after_create(&self, _key: &String, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &CacheEntry,
        _read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process implementation backed by moka / 进程内实现
pub struct MemorySessionCache {
    entries: Cache<String, CacheEntry>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().expire_after(SlidingExpiry).build(),
        }
    }

    /// Evict expired entries now instead of on the next maintenance pass / 清理过期会话
    pub fn purge_expired(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemorySessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache for MemorySessionCache {
    fn get(&self, key: &str) -> Option<UploadSession> {
        let entry = self.entries.get(key);
        if entry.is_none() {
            tracing::debug!("Upload session missing or expired: {}", key);
        }
        entry.map(|e| e.session)
    }

    fn set(&self, key: &str, session: UploadSession, ttl: Duration) {
        self.entries.insert(key.to_string(), CacheEntry { session, ttl });
    }

    fn remove(&self, key: &str) {
        self.entries.invalidate(key);
    }
}
