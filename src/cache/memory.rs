//! Process-local cache with a periodic expiry sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, CacheResult, CacheStore, CachedObject};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct MemoryEntry {
    object: CachedObject,
    expires_at: Option<Instant>,
}

type Entries = Arc<RwLock<HashMap<CacheKey, MemoryEntry>>>;

/// In-memory cache keyed by [`CacheKey`].
///
/// With a TTL, entries are removed by a background sweep once their expiry has
/// passed; lookups do not check expiry themselves. Without a TTL no sweep task
/// runs and entries live for the lifetime of the process.
pub struct MemoryCache {
    entries: Entries,
    ttl: Option<Duration>,
    shutdown: CancellationToken,
}

impl MemoryCache {
    /// Must be called from within a tokio runtime when `ttl` is set.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_sweep_interval(ttl, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(ttl: Option<Duration>, every: Duration) -> Self {
        let ttl = ttl.filter(|t| !t.is_zero());
        let cache = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            shutdown: CancellationToken::new(),
        };
        if ttl.is_some() {
            spawn_sweeper(cache.entries.clone(), every, cache.shutdown.clone());
        }
        cache
    }

    /// Stops the sweep task. Entries stay readable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_sweeper(entries: Entries, every: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let removed = sweep(&entries, Instant::now()).await;
            tracing::debug!(removed, "Expired cache entries swept");
        }
        tracing::debug!("Cache sweep stopped");
    });
}

async fn sweep(entries: &Entries, now: Instant) -> usize {
    let mut map = entries.write().await;
    let before = map.len();
    map.retain(|key, entry| match entry.expires_at {
        Some(at) if now > at => {
            tracing::trace!(key = %key, "Cache entry expired");
            false
        }
        _ => true,
    });
    before - map.len()
}

#[async_trait::async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedObject>> {
        let map = self.entries.read().await;
        Ok(map.get(key).map(|entry| entry.object.clone()))
    }

    async fn set(&self, key: &CacheKey, payload: &[u8]) -> CacheResult<()> {
        let entry = MemoryEntry {
            object: CachedObject {
                payload: Bytes::copy_from_slice(payload),
                created_at: OffsetDateTime::now_utc(),
            },
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(key.clone(), entry);
        Ok(())
    }
}
