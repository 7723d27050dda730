use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use reqwest::Url;

use crate::cache::{CacheError, CacheResult, KvClient};

/// Redis connection shared by all requests through a multiplexed connection.
pub struct RedisClient {
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn connect(host: &str, port: u16, password: Option<&str>, db: i64) -> CacheResult<Self> {
        let mut url = Url::parse(&format!("redis://{host}:{port}/{db}"))
            .map_err(|e| CacheError::Backend(format!("Redis address error: {e}")))?;
        if let Some(password) = password {
            url.set_password(Some(password))
                .map_err(|_| CacheError::Backend("Redis password cannot be set on address".into()))?;
        }

        let client = Client::open(url.as_str())
            .map_err(|e| CacheError::Backend(format!("Redis client error: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend(format!("Redis connection error: {e}")))?;

        tracing::info!(host, port, db, "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl KvClient for RedisClient {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, value, ttl.as_secs().max(1))
                    .await
                    .map_err(|e| CacheError::Backend(format!("Redis SETEX error: {e}")))?;
            }
            None => {
                let _: () = conn
                    .set(key, value)
                    .await
                    .map_err(|e| CacheError::Backend(format!("Redis SET error: {e}")))?;
            }
        }
        Ok(())
    }

    async fn fetch(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| CacheError::Backend(format!("Redis GET error: {e}")))
    }
}
