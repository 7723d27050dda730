pub mod disk;
pub mod key;
pub mod kv;
pub mod memcache;
pub mod memory;
pub mod redis;

pub use disk::DiskCache;
pub use key::CacheKey;
pub use kv::{KvCache, KvClient};
pub use self::memcache::MemcacheClient;
pub use memory::MemoryCache;
pub use self::redis::RedisClient;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::CacheKind;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// A stored artifact plus the moment it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub payload: Bytes,
    pub created_at: OffsetDateTime,
}

/// Storage for optimized images.
///
/// `get` returns `Ok(None)` for absent entries; a present entry may still carry an
/// empty payload. `set` fully replaces any previous value under the same key.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedObject>>;

    async fn set(&self, key: &CacheKey, payload: &[u8]) -> CacheResult<()>;
}

/// Builds the backend selected by configuration.
pub async fn build_store(kind: &CacheKind) -> CacheResult<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match kind {
        CacheKind::File { path } => Arc::new(DiskCache::new(path.clone())),
        CacheKind::InMemory { ttl } => Arc::new(MemoryCache::new(*ttl)),
        CacheKind::Redis { host, port, password, db, ttl } => {
            let client = RedisClient::connect(host, *port, password.as_deref(), *db).await?;
            Arc::new(KvCache::new(client, *ttl))
        }
        CacheKind::Memcache { host, port, username, password, ttl } => {
            let client =
                MemcacheClient::connect(host, *port, username.as_deref(), password.as_deref()).await?;
            Arc::new(KvCache::new(client, *ttl))
        }
    };
    Ok(store)
}
