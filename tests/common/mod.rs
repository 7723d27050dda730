#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, MethodRouter};
use axum::Router;
use bytes::Bytes;
use imgopt::cache::{CacheError, CacheKey, CacheResult, CacheStore, CachedObject};
use imgopt::optimizer::OptimizeRequest;
use imgopt::transform::{TransformError, TransformOptions, Transformer};

pub const LIMIT: u64 = 64 * 1024;

pub const SVG: &[u8] = br#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10"/></svg>"#;

pub fn png(w: u32, h: u32) -> Vec<u8> {
    encoded(w, h, image::ImageFormat::Png)
}

pub fn encoded(w: u32, h: u32, format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 4) as u8, (y * 8) as u8, 90]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), format)
        .unwrap();
    out
}

/// AVIF fixture, encoded once per test binary on first use.
pub fn avif() -> Bytes {
    static AVIF: OnceLock<Bytes> = OnceLock::new();
    AVIF.get_or_init(|| Bytes::from(encoded(64, 32, image::ImageFormat::Avif)))
        .clone()
}

/// Counts requests per method on the origin.
#[derive(Default, Clone)]
pub struct Hits {
    pub heads: Arc<AtomicUsize>,
    pub gets: Arc<AtomicUsize>,
}

impl Hits {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

/// A route whose HEAD answers with `head_type`/`head_len` and whose GET serves `body`.
fn source(hits: &Hits, head_type: &'static str, head_len: Option<u64>, body: Bytes) -> MethodRouter {
    let h = hits.clone();
    let g = hits.clone();
    get(move || {
        let body = body.clone();
        let g = g.clone();
        async move {
            g.gets.fetch_add(1, Ordering::SeqCst);
            ([(header::CONTENT_TYPE, head_type)], body)
        }
    })
    .head(move || {
        let h = h.clone();
        async move {
            h.heads.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(head_type));
            if let Some(len) = head_len {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
            (StatusCode::OK, headers)
        }
    })
}

pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Hits,
    pub png: Bytes,
}

impl Origin {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Spawns a local origin serving the fixtures used across tests.
pub async fn spawn_origin() -> Origin {
    let hits = Hits::default();
    let png = Bytes::from(png(64, 32));

    let bmp = Bytes::from(encoded(64, 32, image::ImageFormat::Bmp));
    let tiff = Bytes::from(encoded(64, 32, image::ImageFormat::Tiff));

    let app = Router::new()
        .route("/cat.png", source(&hits, "image/png", Some(png.len() as u64), png.clone()))
        .route("/cat.bmp", source(&hits, "image/bmp", Some(bmp.len() as u64), bmp))
        .route("/cat.tiff", source(&hits, "image/tiff", Some(tiff.len() as u64), tiff))
        .route(
            "/cat.avif",
            get(|| async { ([(header::CONTENT_TYPE, "image/avif")], avif()) }).head(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/avif"));
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(avif().len()));
                (StatusCode::OK, headers)
            }),
        )
        .route("/big.png", source(&hits, "image/png", Some(LIMIT + 1), png.clone()))
        .route("/page", source(&hits, "text/html", Some(13), Bytes::from_static(b"<html></html>")))
        .route("/lying.png", source(&hits, "image/png", Some(13), Bytes::from_static(b"<html></html>")))
        .route("/logo.svg", source(&hits, "image/svg+xml", Some(SVG.len() as u64), Bytes::from_static(SVG)))
        .route(
            "/slow.png",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                StatusCode::OK
            })
            .head(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                StatusCode::OK
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Origin { addr, hits, png }
}

pub fn request(url: &str) -> OptimizeRequest {
    OptimizeRequest {
        source_url: url.to_string(),
        width: 16,
        height: 0,
        quality: 80,
        if_modified_since: None,
        cache_control: None,
        max_image_size: LIMIT,
        authorized_hosts: None,
        fetch_timeout: Duration::from_secs(1),
        accepted_formats: vec![],
    }
}

/// Returns a fixed output and counts calls.
pub struct FixedTransformer {
    pub output: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FixedTransformer {
    pub fn new(output: Vec<u8>) -> Self {
        Self { output, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transformer for FixedTransformer {
    fn transform(&self, _source: &[u8], _opts: &TransformOptions) -> Result<Vec<u8>, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Store whose reads and/or writes fail.
pub struct BrokenStore {
    pub fail_reads: bool,
}

#[async_trait::async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _key: &CacheKey) -> CacheResult<Option<CachedObject>> {
        if self.fail_reads {
            return Err(CacheError::Backend("disk on fire".into()));
        }
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _payload: &[u8]) -> CacheResult<()> {
        Err(CacheError::Backend("disk full".into()))
    }
}
