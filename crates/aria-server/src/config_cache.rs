//! Read-through cache for the system safety configuration.
//!
//! Every quota check and the maintenance gate read configuration through
//! this cache, so a maintenance toggle and a limit change become visible
//! within the same TTL window everywhere. The administrative service edits
//! the row out-of-band and calls the invalidate endpoint; the next read
//! then reloads from storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aria_db::{load_active_config, DbPool, SafetyConfigError};
use aria_types::SafetyConfig;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from configuration reads.
#[derive(Debug, Error)]
pub enum ConfigCacheError {
    /// No active configuration row exists. A deployment error, never
    /// worked around with hardcoded defaults.
    #[error("no active system safety configuration row")]
    Missing,

    #[error("failed to load safety configuration: {0}")]
    Load(#[from] SafetyConfigError),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug)]
struct CacheEntry {
    config: SafetyConfig,
    loaded_at: Instant,
}

/// An injected read-through cache with a bounded TTL and an explicit
/// invalidate operation. Cloning shares the underlying cache.
#[derive(Clone)]
pub struct ConfigCache {
    pool: DbPool,
    ttl: Duration,
    entry: Arc<RwLock<Option<CacheEntry>>>,
}

impl ConfigCache {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            entry: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the active configuration, from cache when fresh.
    pub async fn get(&self) -> Result<SafetyConfig, ConfigCacheError> {
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(entry.config.clone());
                }
            }
        }
        self.reload().await
    }

    /// Clears the cache so the next `get` reloads from storage.
    pub async fn invalidate(&self) {
        let mut guard = self.entry.write().await;
        *guard = None;
        tracing::info!("safety configuration cache invalidated");
    }

    async fn reload(&self) -> Result<SafetyConfig, ConfigCacheError> {
        let pool = self.pool.clone();
        let loaded = tokio::task::spawn_blocking(
            move || -> Result<Option<SafetyConfig>, ConfigCacheError> {
                let conn = pool.get()?;
                Ok(load_active_config(&conn)?)
            },
        )
        .await??;

        let config = loaded.ok_or(ConfigCacheError::Missing)?;

        let mut guard = self.entry.write().await;
        // A concurrent reload may have beaten us; last write wins, both
        // hold the same row.
        *guard = Some(CacheEntry {
            config: config.clone(),
            loaded_at: Instant::now(),
        });
        Ok(config)
    }
}
