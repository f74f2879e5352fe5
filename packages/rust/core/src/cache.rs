//! Identity cache keyed by the normalized description hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use tenderscout_shared::{GoldIdentity, Result, SpecExtraction, TenderScoutError};
use tenderscout_storage::Storage;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Freshness window in days as a duration.
pub fn ttl_days(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * SECS_PER_DAY)
}

/// A validated identity with the extraction that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedIdentity {
    pub gold: GoldIdentity,
    pub extraction: SpecExtraction,
}

/// Shared across concurrent items; the last write for a key wins.
#[async_trait]
pub trait IdentityCache: Send + Sync {
    /// A fresh entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<CachedIdentity>>;

    async fn put(&self, key: &str, description: &str, entry: &CachedIdentity) -> Result<()>;
}

/// Process-local cache.
pub struct MemoryIdentityCache {
    entries: RwLock<HashMap<String, (Instant, CachedIdentity)>>,
    ttl: Duration,
}

impl MemoryIdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl IdentityCache for MemoryIdentityCache {
    async fn get(&self, key: &str) -> Result<Option<CachedIdentity>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(stored, _)| stored.elapsed() <= self.ttl)
            .map(|(_, entry)| entry.clone()))
    }

    async fn put(&self, key: &str, _description: &str, entry: &CachedIdentity) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), (Instant::now(), entry.clone()));
        Ok(())
    }
}

/// Cache persisted in the libSQL database.
pub struct StorageIdentityCache {
    storage: Arc<Storage>,
    ttl: Duration,
}

impl StorageIdentityCache {
    pub fn new(storage: Arc<Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }
}

#[async_trait]
impl IdentityCache for StorageIdentityCache {
    async fn get(&self, key: &str) -> Result<Option<CachedIdentity>> {
        let Some(json) = self.storage.get_identity(key, self.ttl).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, description: &str, entry: &CachedIdentity) -> Result<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| TenderScoutError::Storage(format!("serialize identity: {e}")))?;
        self.storage.put_identity(key, description, &json).await
    }
}
