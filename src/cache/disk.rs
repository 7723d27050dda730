use crate::cache::{CacheKey, CacheResult, CacheStore, CachedObject};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::fs;

/// Disk-based cache: one file per key directly under the root directory.
///
/// The file's modification time is the entry's creation time. There is no
/// eviction; retention is left to the operator.
pub struct DiskCache {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl DiskCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, tmp_seq: AtomicU64::new(0) }
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    async fn ensure_dir(&self) -> CacheResult<()> {
        if fs::metadata(&self.dir).await.is_err() {
            tracing::info!(dir = %self.dir.display(), "Cache directory does not exist, creating it");
            fs::create_dir_all(&self.dir).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheStore for DiskCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedObject>> {
        let p = self.path_for(key);
        let meta = match fs::metadata(&p).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let created_at = OffsetDateTime::from(meta.modified()?);
        match fs::read(&p).await {
            Ok(data) => Ok(Some(CachedObject { payload: data.into(), created_at })),
            // Removed between stat and read.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &CacheKey, payload: &[u8]) -> CacheResult<()> {
        self.ensure_dir().await?;

        // Readers must never observe a half-written file.
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{}.{}.{}.tmp", key, std::process::id(), seq));
        fs::write(&tmp, payload).await?;
        if let Err(e) = fs::rename(&tmp, self.path_for(key)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
