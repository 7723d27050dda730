use std::time::Duration;

use bytes::Bytes;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::cache::{CacheError, CacheKey, CacheResult, CacheStore, CachedObject};

/// Minimal surface of an external key-value service.
#[async_trait::async_trait]
pub trait KvClient: Send + Sync {
    /// Stores `value`; `ttl` of `None` means no server-side expiry.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    async fn fetch(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;
}

/// Cache stored in an external key-value service.
///
/// Each entry is written as two keys with the same expiry: the payload under the
/// cache key and an RFC 3339 creation timestamp under `<key>:created_at`. An entry
/// whose timestamp is missing or unreadable is reported as absent.
pub struct KvCache<C> {
    client: C,
    ttl: Option<Duration>,
}

impl<C: KvClient> KvCache<C> {
    pub fn new(client: C, ttl: Option<Duration>) -> Self {
        Self { client, ttl: ttl.filter(|t| !t.is_zero()) }
    }

    fn created_at_key(key: &CacheKey) -> String {
        format!("{key}:created_at")
    }
}

#[async_trait::async_trait]
impl<C: KvClient> CacheStore for KvCache<C> {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedObject>> {
        let Some(raw) = self.client.fetch(&Self::created_at_key(key)).await? else {
            return Ok(None);
        };
        let created_at = match std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        {
            Some(ts) => ts,
            None => {
                tracing::warn!(key = %key, "Unreadable cache timestamp, treating entry as absent");
                return Ok(None);
            }
        };
        let Some(payload) = self.client.fetch(key.as_str()).await? else {
            return Ok(None);
        };
        Ok(Some(CachedObject { payload: Bytes::from(payload), created_at }))
    }

    async fn set(&self, key: &CacheKey, payload: &[u8]) -> CacheResult<()> {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        self.client
            .put(&Self::created_at_key(key), now.as_bytes(), self.ttl)
            .await?;
        self.client.put(key.as_str(), payload, self.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records writes and serves reads from a plain map.
    #[derive(Default)]
    struct FakeKv {
        values: Mutex<HashMap<String, Vec<u8>>>,
        ttls: Mutex<HashMap<String, Option<Duration>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl KvClient for FakeKv {
        async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
            if self.fail {
                return Err(CacheError::Backend("connection refused".into()));
            }
            self.values.lock().unwrap().insert(key.to_string(), value.to_vec());
            self.ttls.lock().unwrap().insert(key.to_string(), ttl);
            Ok(())
        }

        async fn fetch(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            if self.fail {
                return Err(CacheError::Backend("connection refused".into()));
            }
            Ok(self.values.lock().unwrap().get(key).cloned())
        }
    }

    fn key() -> CacheKey {
        CacheKey::for_source("https://example.com/a.png", 10, 0, 80, true)
    }

    #[tokio::test]
    async fn writes_two_keys_with_same_ttl() {
        let cache = KvCache::new(FakeKv::default(), Some(Duration::from_secs(600)));
        cache.set(&key(), b"img").await.unwrap();

        let ttls = cache.client.ttls.lock().unwrap().clone();
        assert_eq!(ttls.len(), 2);
        assert!(ttls.values().all(|t| *t == Some(Duration::from_secs(600))));

        let obj = cache.get(&key()).await.unwrap().unwrap();
        assert_eq!(&obj.payload[..], b"img");
    }

    #[tokio::test]
    async fn zero_ttl_means_no_expiry() {
        let cache = KvCache::new(FakeKv::default(), Some(Duration::ZERO));
        cache.set(&key(), b"img").await.unwrap();
        assert!(cache.client.ttls.lock().unwrap().values().all(Option::is_none));
    }

    #[tokio::test]
    async fn payload_without_timestamp_is_absent() {
        let cache = KvCache::new(FakeKv::default(), None);
        cache
            .client
            .values
            .lock()
            .unwrap()
            .insert(key().to_string(), b"stale".to_vec());
        assert!(cache.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_timestamp_is_absent() {
        let cache = KvCache::new(FakeKv::default(), None);
        cache.set(&key(), b"img").await.unwrap();
        cache
            .client
            .values
            .lock()
            .unwrap()
            .insert(format!("{}:created_at", key()), b"yesterday".to_vec());
        assert!(cache.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let cache = KvCache::new(FakeKv { fail: true, ..Default::default() }, None);
        assert!(cache.get(&key()).await.is_err());
        assert!(cache.set(&key(), b"img").await.is_err());
    }
}
