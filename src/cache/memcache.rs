use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Url;

use crate::cache::{CacheError, CacheResult, KvClient};

/// Largest relative expiry memcached accepts; longer values are read as a unix timestamp.
const MAX_RELATIVE_EXPIRY: u64 = 30 * 24 * 60 * 60;

/// Memcached client. Calls are blocking and run on the blocking pool.
#[derive(Clone)]
pub struct MemcacheClient {
    client: ::memcache::Client,
}

impl MemcacheClient {
    /// Connects over the binary protocol, authenticating with SASL when a
    /// username and password are given.
    pub async fn connect(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> CacheResult<Self> {
        let mut url = Url::parse(&format!("memcache://{host}:{port}"))
            .map_err(|e| CacheError::Backend(format!("Memcache address error: {e}")))?;
        if let (Some(user), Some(password)) = (username, password) {
            url.set_username(user)
                .and_then(|_| url.set_password(Some(password)))
                .map_err(|_| CacheError::Backend("Memcache credentials cannot be set on address".into()))?;
        }

        let client = tokio::task::spawn_blocking(move || {
            let client = ::memcache::Client::connect(url.as_str())?;
            client.version()?;
            Ok::<_, ::memcache::MemcacheError>(client)
        })
        .await
        .map_err(|e| CacheError::Backend(format!("Memcache connect task failed: {e}")))?
        .map_err(|e| CacheError::Backend(format!("Memcache connection error: {e}")))?;

        tracing::info!(host, port, "Connected to Memcache");
        Ok(Self { client })
    }
}

/// Memcached expiry field for `ttl`: 0 never expires, anything past 30 days
/// becomes an absolute timestamp.
fn expiration(ttl: Option<Duration>, now: SystemTime) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let secs = ttl.as_secs().max(1);
    if secs <= MAX_RELATIVE_EXPIRY {
        return secs as u32;
    }
    let epoch = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    u32::try_from(epoch + secs).unwrap_or(u32::MAX)
}

#[async_trait::async_trait]
impl KvClient for MemcacheClient {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let client = self.client.clone();
        let key = key.to_string();
        let value = value.to_vec();
        let exp = expiration(ttl, SystemTime::now());
        tokio::task::spawn_blocking(move || client.set(&key, value.as_slice(), exp))
            .await
            .map_err(|e| CacheError::Backend(format!("Memcache task failed: {e}")))?
            .map_err(|e| CacheError::Backend(format!("Memcache SET error: {e}")))
    }

    async fn fetch(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let client = self.client.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || client.get::<Vec<u8>>(&key))
            .await
            .map_err(|e| CacheError::Backend(format!("Memcache task failed: {e}")))?
            .map_err(|e| CacheError::Backend(format!("Memcache GET error: {e}")))
    }
}
