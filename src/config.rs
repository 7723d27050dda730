use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_IMAGE_PATH: &str = "/image";
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 8 * 1024 * 1024;

/// Which storage backend holds optimized images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKind {
    /// One file per key under `path`.
    File { path: PathBuf },
    /// Process-local map; `ttl` of `None` keeps entries forever.
    InMemory { ttl: Option<Duration> },
    /// Redis, two keys per entry with a server-side expiry.
    Redis {
        host: String,
        port: u16,
        password: Option<String>,
        db: i64,
        ttl: Option<Duration>,
    },
    /// Memcached, same two-key layout as Redis; credentials enable SASL auth.
    Memcache {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        ttl: Option<Duration>,
    },
}

impl CacheKind {
    pub fn name(&self) -> &'static str {
        match self {
            CacheKind::File { .. } => "file",
            CacheKind::InMemory { .. } => "in-memory",
            CacheKind::Redis { .. } => "redis",
            CacheKind::Memcache { .. } => "memcache",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub port: u16,
    pub image_path: String,
    /// Local path or absolute URL of the placeholder served for broken sources.
    pub broken_image_source: Option<String>,
    pub default_quality: u8,
    pub max_image_size: u64, // bytes
    pub cache: CacheKind,
    pub authorized_hosts: Option<Regex>,
    pub fetch_timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            image_path: DEFAULT_IMAGE_PATH.to_string(),
            broken_image_source: None,
            default_quality: DEFAULT_QUALITY,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            cache: CacheKind::File { path: PathBuf::from("./cache") },
            authorized_hosts: None,
            fetch_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DEFAULT_QUALITY must be between 1 and 100, got {0}")] InvalidQuality(String),
    #[error("MAX_IMAGE_SIZE is invalid: {0}")] InvalidSize(String),
    #[error("MAX_IMAGE_SIZE must be > 0")] ZeroSize,
    #[error("CACHE_TYPE must be one of file, in-memory, redis, memcache; got {0}")] InvalidCacheType(String),
    #[error("CACHE_PATH is required when CACHE_TYPE is file")] MissingCachePath,
    #[error("REDIS_PORT is required when CACHE_TYPE is redis")] MissingRedisPort,
    #[error("MEMCACHE_PORT is required when CACHE_TYPE is memcache")] MissingMemcachePort,
    #[error("AUTHORIZED_HOSTNAMES is not a valid regex: {0}")] InvalidHostPattern(#[from] regex::Error),
    #[error("{name} is not a valid number: {value}")] InvalidNumber { name: &'static str, value: String },
}

impl OptimizerConfig {
    /// Builds the configuration from process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let port = match var("API_PORT") {
            Some(v) => parse_number("API_PORT", &v)?,
            None => defaults.port,
        };

        let default_quality = match var("DEFAULT_QUALITY") {
            Some(v) => v
                .trim()
                .parse::<u8>()
                .map_err(|_| ConfigError::InvalidQuality(v.clone()))?,
            None => defaults.default_quality,
        };

        let max_image_size = match var("MAX_IMAGE_SIZE") {
            Some(v) => parse_size(&v)?,
            None => defaults.max_image_size,
        };

        let ttl = match var("CACHE_EXPIRATION") {
            Some(v) => {
                let minutes: u64 = parse_number("CACHE_EXPIRATION", &v)?;
                (minutes > 0).then(|| Duration::from_secs(minutes * 60))
            }
            None => None,
        };

        let cache_type = var("CACHE_TYPE").unwrap_or_else(|| "file".to_string());
        let cache = match cache_type.as_str() {
            "file" => CacheKind::File {
                path: PathBuf::from(var("CACHE_PATH").unwrap_or_else(|| "./cache".to_string())),
            },
            "in-memory" => CacheKind::InMemory { ttl },
            "redis" => {
                let port = var("REDIS_PORT").ok_or(ConfigError::MissingRedisPort)?;
                CacheKind::Redis {
                    host: var("REDIS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                    port: parse_number("REDIS_PORT", &port)?,
                    password: var("REDIS_PASSWORD"),
                    db: match var("REDIS_DB") {
                        Some(v) => parse_number("REDIS_DB", &v)?,
                        None => 0,
                    },
                    ttl,
                }
            }
            "memcache" => {
                let port = var("MEMCACHE_PORT").ok_or(ConfigError::MissingMemcachePort)?;
                CacheKind::Memcache {
                    host: var("MEMCACHE_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                    port: parse_number("MEMCACHE_PORT", &port)?,
                    username: var("MEMCACHE_USERNAME"),
                    password: var("MEMCACHE_PASSWORD"),
                    ttl,
                }
            }
            other => return Err(ConfigError::InvalidCacheType(other.to_string())),
        };

        let authorized_hosts = var("AUTHORIZED_HOSTNAMES")
            .map(|pattern| Regex::new(&pattern))
            .transpose()?;

        let timeout_secs = match var("IMAGE_DOWNLOAD_TIMEOUT") {
            Some(v) => parse_number::<i64>("IMAGE_DOWNLOAD_TIMEOUT", &v)?,
            None => 1,
        };

        let cfg = Self {
            port,
            image_path: var("IMAGE_API_PATH").unwrap_or(defaults.image_path),
            broken_image_source: var("BROKEN_IMAGE_PATH"),
            default_quality,
            max_image_size,
            cache,
            authorized_hosts,
            fetch_timeout: Duration::from_secs(timeout_secs.max(1) as u64),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_quality == 0 || self.default_quality > 100 {
            return Err(ConfigError::InvalidQuality(self.default_quality.to_string()));
        }
        if self.max_image_size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if let CacheKind::File { path } = &self.cache {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingCachePath);
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    })
}

/// Parses sizes such as `512`, `300KB` or `8mb` into bytes (1024-based).
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let upper = raw.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else {
        (upper.as_str(), 1)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidSize(raw.to_string()))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("300KB").unwrap(), 300 * 1024);
        assert_eq!(parse_size("8mb").unwrap(), 8 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn defaults_to_file_cache() {
        let cfg = OptimizerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.cache, CacheKind::File { path: PathBuf::from("./cache") });
        assert_eq!(cfg.image_path, "/image");
        assert_eq!(cfg.default_quality, DEFAULT_QUALITY);
    }

    #[test]
    fn timeout_is_at_least_one_second() {
        let cfg = OptimizerConfig::from_lookup(lookup(&[("IMAGE_DOWNLOAD_TIMEOUT", "0")])).unwrap();
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(1));
        let cfg = OptimizerConfig::from_lookup(lookup(&[("IMAGE_DOWNLOAD_TIMEOUT", "5")])).unwrap();
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(5));
    }

    #[test]
    fn in_memory_ttl_in_minutes() {
        let cfg = OptimizerConfig::from_lookup(lookup(&[
            ("CACHE_TYPE", "in-memory"),
            ("CACHE_EXPIRATION", "2"),
        ]))
        .unwrap();
        assert_eq!(cfg.cache, CacheKind::InMemory { ttl: Some(Duration::from_secs(120)) });

        let cfg = OptimizerConfig::from_lookup(lookup(&[("CACHE_TYPE", "in-memory")])).unwrap();
        assert_eq!(cfg.cache, CacheKind::InMemory { ttl: None });
    }

    #[test]
    fn memcache_settings() {
        let cfg = OptimizerConfig::from_lookup(lookup(&[
            ("CACHE_TYPE", "memcache"),
            ("MEMCACHE_HOST", "mc.internal"),
            ("MEMCACHE_PORT", "11211"),
            ("MEMCACHE_USERNAME", "app"),
            ("MEMCACHE_PASSWORD", "hunter2"),
            ("CACHE_EXPIRATION", "10"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.cache,
            CacheKind::Memcache {
                host: "mc.internal".into(),
                port: 11211,
                username: Some("app".into()),
                password: Some("hunter2".into()),
                ttl: Some(Duration::from_secs(600)),
            }
        );
        assert_eq!(cfg.cache.name(), "memcache");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            OptimizerConfig::from_lookup(lookup(&[("CACHE_TYPE", "memcached")])),
            Err(ConfigError::InvalidCacheType(_))
        ));
        assert!(matches!(
            OptimizerConfig::from_lookup(lookup(&[("CACHE_TYPE", "redis")])),
            Err(ConfigError::MissingRedisPort)
        ));
        assert!(matches!(
            OptimizerConfig::from_lookup(lookup(&[("CACHE_TYPE", "memcache")])),
            Err(ConfigError::MissingMemcachePort)
        ));
        assert!(matches!(
            OptimizerConfig::from_lookup(lookup(&[("DEFAULT_QUALITY", "0")])),
            Err(ConfigError::InvalidQuality(_))
        ));
        assert!(matches!(
            OptimizerConfig::from_lookup(lookup(&[("AUTHORIZED_HOSTNAMES", "(")])),
            Err(ConfigError::InvalidHostPattern(_))
        ));
    }
}
