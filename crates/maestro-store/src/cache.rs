//! Cache collaborator seam with per-category TTLs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::CacheError;

/// Default TTL for generic entries: 1 hour.
pub const TTL_DEFAULT: Duration = Duration::from_secs(3600);
/// TTL for session bindings: 24 hours.
pub const TTL_SESSION: Duration = Duration::from_secs(86_400);
/// TTL for cached agent results: 5 minutes.
pub const TTL_AGENT_RESULT: Duration = Duration::from_secs(300);
/// TTL for user data: 2 hours.
pub const TTL_USER_DATA: Duration = Duration::from_secs(7200);

/// Key/value cache with per-entry expiry.
///
/// Values are JSON; callers pick the TTL from the constants above or supply
/// their own. Failed reads degrade to `None` at call sites.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store a value with the given TTL.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Fetch a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError>;

    /// Remove a value.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-memory cache driver with lazy expiry.
///
/// Expired entries are dropped on read; no background sweeper runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, (serde_json::Value, Instant)>>>,
}

impl MemoryCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, not yet reaped) entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let deadline = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, deadline)) if *deadline > Instant::now() => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().await.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = MemoryCache::new();
        cache
            .set("k", serde_json::json!({"v": 1}), TTL_DEFAULT)
            .await
            .unwrap();
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(serde_json::json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn expired_entries_read_as_none() {
        let cache = MemoryCache::new();
        cache
            .set("k", serde_json::json!(true), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        // The expired entry was reaped on read.
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = MemoryCache::new();
        cache
            .set("k", serde_json::json!(1), TTL_DEFAULT)
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
