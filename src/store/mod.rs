pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Key-value persistence port with per-key TTL.
///
/// All engine state lives in per-key serialized blobs behind this trait.
/// Values are JSON text and must round-trip arbitrary UTF-8 exactly.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;
}

/// Key namespace shared by all subsystems.
///
/// Key layout:
/// - `<ns>:emotion:<group>`
/// - `<ns>:expression:<group>`
/// - `<ns>:memory:<group>:<user>`
/// - `<ns>:memory:group:<group>`
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn emotion(&self, group_id: &str) -> String {
        format!("{}:emotion:{group_id}", self.prefix)
    }

    pub fn expression(&self, group_id: &str) -> String {
        format!("{}:expression:{group_id}", self.prefix)
    }

    pub fn user_memory(&self, group_id: &str, user_id: &str) -> String {
        format!("{}:memory:{group_id}:{user_id}", self.prefix)
    }

    pub fn group_memory(&self, group_id: &str) -> String {
        format!("{}:memory:group:{group_id}", self.prefix)
    }
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory store with TTL. Backs tests and single-process deployments
/// that don't need durability.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Utc::now() + Duration::seconds(ttl_seconds as i64),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}

/// Per-key async locks serializing read-modify-write cycles within the
/// process. Cross-process writes remain last-write-wins.
#[derive(Default)]
pub struct KeyedLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}
