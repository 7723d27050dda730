//! Request orchestration: validate, look up, fetch, transform, store, respond.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::Url;
use time::OffsetDateTime;

use crate::cache::{CacheKey, CacheStore, CachedObject};
use crate::fetch::SourceFetcher;
use crate::negotiate::{self, choose_format};
use crate::transform::{TransformOptions, Transformer};
use crate::{http_date, sniff, OptimizerError, Result};

/// One inbound optimization call.
#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    pub source_url: String,
    pub width: u32,
    /// 0 keeps the aspect ratio.
    pub height: u32,
    pub quality: u8,
    pub if_modified_since: Option<String>,
    pub cache_control: Option<String>,
    pub max_image_size: u64,
    pub authorized_hosts: Option<Regex>,
    pub fetch_timeout: Duration,
    pub accepted_formats: Vec<String>,
}

impl OptimizeRequest {
    fn accepts_webp(&self) -> bool {
        negotiate::accepts(&self.accepted_formats, negotiate::WEBP)
    }
}

/// Result of an optimization call. A cached response without payload means
/// "not modified".
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResponse {
    pub payload: Option<Bytes>,
    pub format: String,
    pub created_at: OffsetDateTime,
    pub from_cache: bool,
}

impl OptimizeResponse {
    pub fn is_not_modified(&self) -> bool {
        self.from_cache && self.payload.is_none()
    }

    /// Whole seconds since the artifact was created; 0 for fresh results.
    pub fn age(&self, now: OffsetDateTime) -> u64 {
        if !self.from_cache {
            return 0;
        }
        (now - self.created_at).whole_seconds().max(0) as u64
    }
}

/// Coordinates the cache, the source fetcher and the transformer.
pub struct Optimizer {
    store: Arc<dyn CacheStore>,
    transformer: Arc<dyn Transformer>,
    fetcher: SourceFetcher,
    placeholder: Option<Bytes>,
}

impl Optimizer {
    pub fn new(store: Arc<dyn CacheStore>, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            store,
            transformer,
            fetcher: SourceFetcher::default(),
            placeholder: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: SourceFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Image served in place of sources that cannot be fetched.
    pub fn with_placeholder(mut self, placeholder: Bytes) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn has_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }

    pub async fn optimize(&self, req: &OptimizeRequest) -> Result<OptimizeResponse> {
        let url = validate(req)?;

        let key = CacheKey::for_source(
            req.source_url.trim(),
            req.width,
            req.height,
            req.quality,
            req.accepts_webp(),
        );

        if let Some(cached) = self.store.get(&key).await? {
            if is_not_modified(
                cached.created_at,
                req.if_modified_since.as_deref(),
                req.cache_control.as_deref(),
                OffsetDateTime::now_utc(),
            ) {
                tracing::debug!(key = %key, "Cache hit, not modified");
                return Ok(OptimizeResponse {
                    payload: None,
                    format: sniff::detect(&cached.payload).to_string(),
                    created_at: cached.created_at,
                    from_cache: true,
                });
            }
            tracing::debug!(key = %key, "Cache hit");
            return Ok(hit(cached));
        }

        tracing::info!(key = %key, url = %url, "Cache miss, fetching source");
        let source = self
            .fetcher
            .fetch(&url, req.fetch_timeout, req.max_image_size)
            .await?;

        // Never trust the declared type alone.
        let sniffed = sniff::detect(&source);
        if !sniff::is_image(sniffed) {
            return Err(OptimizerError::InvalidImageType(format!("downloaded bytes look like {sniffed}")));
        }

        let (payload, format) = self.render(source, sniffed, req).await?;
        self.store_quietly(&key, &payload).await;

        Ok(OptimizeResponse {
            payload: Some(payload),
            format,
            created_at: OffsetDateTime::now_utc(),
            from_cache: false,
        })
    }

    /// Produces the placeholder variant matching the request's size, quality and
    /// accepted formats, cached under its own key family.
    pub async fn broken_image(&self, req: &OptimizeRequest) -> Result<OptimizeResponse> {
        let placeholder = self.placeholder.clone().ok_or(OptimizerError::NoPlaceholder)?;
        let key = CacheKey::for_placeholder(req.width, req.height, req.quality, req.accepts_webp());

        if let Some(cached) = self.store.get(&key).await? {
            tracing::debug!(key = %key, "Placeholder cache hit");
            return Ok(hit(cached));
        }

        let sniffed = sniff::detect(&placeholder);
        let (payload, format) = self.render(placeholder, sniffed, req).await?;
        self.store_quietly(&key, &payload).await;

        Ok(OptimizeResponse {
            payload: Some(payload),
            format,
            created_at: OffsetDateTime::now_utc(),
            from_cache: false,
        })
    }

    /// Negotiates the output type and transforms `source` into it. Keeps the
    /// source bytes when no format change was asked for and the transform grew them.
    async fn render(&self, source: Bytes, source_mime: &str, req: &OptimizeRequest) -> Result<(Bytes, String)> {
        let target = choose_format(source_mime, &req.accepted_formats);
        tracing::debug!(source = source_mime, target = %target, "Negotiated output format");

        if target == negotiate::SVG {
            return Ok((source, target));
        }

        let opts = TransformOptions {
            width: req.width,
            height: req.height,
            quality: req.quality,
            target: target.clone(),
        };
        let transformer = Arc::clone(&self.transformer);
        let input = source.clone();
        let output = tokio::task::spawn_blocking(move || transformer.transform(&input, &opts))
            .await
            .map_err(|e| OptimizerError::Internal(format!("transform task failed: {e}")))??;

        if output.len() > source.len() && target == source_mime {
            tracing::debug!(
                original = source.len(),
                transformed = output.len(),
                "Transformed image is larger than the original, keeping the original"
            );
            return Ok((source, target));
        }
        Ok((Bytes::from(output), target))
    }

    async fn store_quietly(&self, key: &CacheKey, payload: &[u8]) {
        if let Err(e) = self.store.set(key, payload).await {
            tracing::warn!(key = %key, error = %e, "Failed to save image to cache");
        }
    }
}

fn hit(cached: CachedObject) -> OptimizeResponse {
    OptimizeResponse {
        format: sniff::detect(&cached.payload).to_string(),
        payload: Some(cached.payload),
        created_at: cached.created_at,
        from_cache: true,
    }
}

fn validate(req: &OptimizeRequest) -> Result<Url> {
    if req.width == 0 {
        return Err(OptimizerError::InvalidWidth);
    }

    let url = Url::parse(req.source_url.trim())
        .map_err(|e| OptimizerError::InvalidSourceUrl(format!("{}: {e}", req.source_url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(OptimizerError::InvalidSourceUrl(format!("unsupported scheme {}", url.scheme())));
    }
    let Some(host) = url.host_str() else {
        return Err(OptimizerError::InvalidSourceUrl(format!("{} has no host", req.source_url)));
    };

    if let Some(pattern) = &req.authorized_hosts {
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if !pattern.is_match(&authority) {
            return Err(OptimizerError::DomainNotAuthorized(authority));
        }
    }
    Ok(url)
}

/// Whether a cached artifact created at `created_at` may be answered with "not
/// modified".
///
/// Requires an `If-Modified-Since` header (an unparseable one counts as `now`)
/// and a `Cache-Control` header that is present and carries neither `no-cache`
/// nor `no-store`. The artifact must be strictly newer than the header date.
pub fn is_not_modified(
    created_at: OffsetDateTime,
    if_modified_since: Option<&str>,
    cache_control: Option<&str>,
    now: OffsetDateTime,
) -> bool {
    let Some(raw) = if_modified_since.map(str::trim).filter(|s| !s.is_empty()) else {
        return false;
    };
    let since = http_date::parse(raw).unwrap_or(now);

    let directives: Vec<String> = cache_control
        .unwrap_or("")
        .split(',')
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    let revalidation_allowed = !directives.is_empty()
        && !directives.iter().any(|d| d == "no-cache" || d == "no-store");

    revalidation_allowed && created_at > since
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    #[test]
    fn older_client_copy_is_not_modified() {
        let ims = http_date::format(T - time::Duration::seconds(1));
        assert!(is_not_modified(T, Some(&ims), Some("max-age=0"), T));
    }

    #[test]
    fn newer_client_copy_gets_body() {
        let ims = http_date::format(T + time::Duration::seconds(1));
        assert!(!is_not_modified(T, Some(&ims), Some("max-age=0"), T));
    }

    #[test]
    fn cache_control_can_disable_revalidation() {
        let ims = http_date::format(T - time::Duration::seconds(1));
        assert!(!is_not_modified(T, Some(&ims), None, T));
        assert!(!is_not_modified(T, Some(&ims), Some(""), T));
        assert!(!is_not_modified(T, Some(&ims), Some("no-cache"), T));
        assert!(!is_not_modified(T, Some(&ims), Some("no-store"), T));
        assert!(!is_not_modified(T, Some(&ims), Some("max-age=0, no-store"), T));
    }

    #[test]
    fn unparseable_date_counts_as_now() {
        let now = T + time::Duration::minutes(5);
        assert!(!is_not_modified(T, Some("yesterday"), Some("max-age=0"), now));
        let now = T - time::Duration::minutes(5);
        assert!(is_not_modified(T, Some("yesterday"), Some("max-age=0"), now));
    }

    #[test]
    fn missing_header_never_short_circuits() {
        assert!(!is_not_modified(T, None, Some("max-age=0"), T));
    }

    #[test]
    fn age_only_counts_for_cached_results() {
        let mut resp = OptimizeResponse {
            payload: Some(Bytes::from_static(b"x")),
            format: "image/png".into(),
            created_at: T,
            from_cache: true,
        };
        assert_eq!(resp.age(T + time::Duration::seconds(42)), 42);
        resp.from_cache = false;
        assert_eq!(resp.age(T + time::Duration::seconds(42)), 0);
    }

    fn request(url: &str, hosts: Option<&str>) -> OptimizeRequest {
        OptimizeRequest {
            source_url: url.to_string(),
            width: 100,
            height: 0,
            quality: 80,
            if_modified_since: None,
            cache_control: None,
            max_image_size: 1024,
            authorized_hosts: hosts.map(|h| Regex::new(h).unwrap()),
            fetch_timeout: Duration::from_secs(1),
            accepted_formats: vec![],
        }
    }

    #[test]
    fn validation() {
        assert!(validate(&request("https://img.example.com/a.png", None)).is_ok());
        assert!(matches!(
            validate(&request("not a url", None)),
            Err(OptimizerError::InvalidSourceUrl(_))
        ));
        assert!(matches!(
            validate(&request("ftp://img.example.com/a.png", None)),
            Err(OptimizerError::InvalidSourceUrl(_))
        ));
        assert!(matches!(
            validate(&request("https://evil.test/a.png", Some(r"^img\.example\.com$"))),
            Err(OptimizerError::DomainNotAuthorized(_))
        ));
        assert!(validate(&request("https://img.example.com/a.png", Some(r"^img\.example\.com$"))).is_ok());

        let mut zero = request("https://img.example.com/a.png", None);
        zero.width = 0;
        assert!(matches!(validate(&zero), Err(OptimizerError::InvalidWidth)));
    }
}
