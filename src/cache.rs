//! Fast key-value store with per-key expiry
//!
//! Holds two kinds of per-application keys:
//! - `app:{id}:instances`: cached instance count (string-encoded integer)
//! - `app:{id}:deployed`: existence-only hint that the app was deployed
//!
//! Expiry, not explicit invalidation, is what bounds staleness.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Key holding the cached instance count of an application
pub fn instances_key(app_id: i64) -> String {
    format!("app:{}:instances", app_id)
}

/// Key holding the "deployed" hint of an application
pub fn deployed_key(app_id: i64) -> String {
    format!("app:{}:deployed", app_id)
}

/// Key-value cache with expiring entries
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    /// Set a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration);

    async fn del(&self, key: &str);

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cache
///
/// Expired entries are dropped lazily on read.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let value = {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                Some(entry.value.clone())
            } else {
                None
            }
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        value
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn del(&self, key: &str) {
        self.entries.remove(key);
    }
}
