//! HTTP image optimization gateway.
//!
//! Fetches a remote image, resizes it, re-encodes it to the best format the
//! client accepts and caches the result. The crate is organised as:
//! - [`optimizer`]: the request pipeline and broken-image fallback
//! - [`cache`]: storage backends behind [`cache::CacheStore`]
//! - [`fetch`], [`transform`], [`negotiate`], [`sniff`]: the pipeline stages
//! - this module: error mapping, response headers and the axum [`router`]

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod config;
pub mod fetch;
pub mod http_date;
pub mod negotiate;
pub mod optimizer;
pub mod params;
pub mod sniff;
pub mod transform;

use crate::cache::CacheError;
use crate::config::OptimizerConfig;
use crate::optimizer::{OptimizeRequest, OptimizeResponse, Optimizer};
use crate::params::ImageQuery;
use crate::transform::TransformError;

pub const CACHE_CONTROL_VALUE: &str = "public, max-age=7200, must-revalidate";
pub const CONTENT_SECURITY_POLICY: &str = "script-src 'none'; frame-src 'none'; sandbox;";

/// Failure of an image request. Each variant maps to an HTTP status through
/// [`OptimizerError::status`].
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("invalid image url: {0}")]
    InvalidSourceUrl(String),
    #[error("domain not authorized: {0}")]
    DomainNotAuthorized(String),
    #[error("invalid image width")]
    InvalidWidth,
    #[error("invalid image type: {0}")]
    InvalidImageType(String),
    #[error("image too large: {size} bytes exceeds limit of {limit}")]
    ImageTooLarge { size: u64, limit: u64 },
    #[error("image download timeout")]
    FetchTimeout,
    #[error("transform failed: {0}")]
    Encode(#[from] TransformError),
    #[error("storage error: {0}")]
    Storage(#[from] CacheError),
    #[error("no broken image placeholder configured")]
    NoPlaceholder,
    #[error("broken image fallback failed: {0}")]
    Fallback(Box<OptimizerError>),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

impl OptimizerError {
    /// Errors blamed on the source image, answered with the placeholder when one
    /// is configured.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            OptimizerError::InvalidSourceUrl(_)
                | OptimizerError::FetchTimeout
                | OptimizerError::InvalidImageType(_)
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OptimizerError::InvalidWidth | OptimizerError::InvalidSourceUrl(_) => StatusCode::BAD_REQUEST,
            OptimizerError::DomainNotAuthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OptimizerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Request counters exposed on `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub not_modified: AtomicU64,
    pub cache_misses: AtomicU64,
    pub fallbacks: AtomicU64,
    pub errors: AtomicU64,
}

impl Metrics {
    fn record(&self, resp: &OptimizeResponse) {
        let counter = if resp.is_not_modified() {
            &self.not_modified
        } else if resp.from_cache {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let counters = [
            ("imgopt_requests_total", "Total number of image requests", &self.requests),
            ("imgopt_cache_hits_total", "Responses served from cache with a body", &self.cache_hits),
            ("imgopt_not_modified_total", "Conditional hits answered with 304", &self.not_modified),
            ("imgopt_cache_misses_total", "Responses computed from the source", &self.cache_misses),
            ("imgopt_fallbacks_total", "Requests answered with the broken image", &self.fallbacks),
            ("imgopt_errors_total", "Requests that ended in an error", &self.errors),
        ];
        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

/// Shared handler state: the optimizer, the configuration it was built from and
/// the request counters.
#[derive(Clone)]
pub struct AppState {
    pub optimizer: Arc<Optimizer>,
    pub config: Arc<OptimizerConfig>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(optimizer: Optimizer, config: OptimizerConfig) -> Self {
        Self {
            optimizer: Arc::new(optimizer),
            config: Arc::new(config),
            metrics: Arc::new(Metrics::default()),
        }
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Image endpoint.
///
/// Query: `url` (required), `w` (required, > 0), `h` (0 or absent keeps the
/// aspect ratio), `q` (0-100, falls back to the configured default). Honors
/// `Accept`, `If-Modified-Since` and `Cache-Control` request headers.
///
/// # Responses
/// - 200 with the optimized image, or the placeholder when the source is broken
/// - 304 when the client copy is still current
/// - 400 missing or invalid width, or an unusable source without placeholder
/// - 401 source host not authorized
/// - 500 anything else
async fn image_handler(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Response {
    state.metrics.requests.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(url = ?query.url, w = ?query.w, h = ?query.h, q = ?query.q, "Processing image request");

    let params = match query.resolve(state.config.default_quality) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting request");
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            return OptimizerError::InvalidWidth.into_response();
        }
    };

    let req = OptimizeRequest {
        source_url: query.url.unwrap_or_default(),
        width: params.width,
        height: params.height,
        quality: params.quality,
        if_modified_since: header_string(&headers, header::IF_MODIFIED_SINCE),
        cache_control: header_string(&headers, header::CACHE_CONTROL),
        max_image_size: state.config.max_image_size,
        authorized_hosts: state.config.authorized_hosts.clone(),
        fetch_timeout: state.config.fetch_timeout,
        accepted_formats: header_string(&headers, header::ACCEPT)
            .map(|a| negotiate::parse_accept(&a))
            .unwrap_or_default(),
    };

    match serve(&state, &req).await {
        Ok(resp) => {
            state.metrics.record(&resp);
            image_response(&resp, OffsetDateTime::now_utc())
        }
        Err(e) => {
            state.metrics.errors.fetch_add(1, Ordering::Relaxed);
            if e.status().is_server_error() {
                tracing::error!(url = %req.source_url, error = %e, "Error optimizing image");
            } else {
                tracing::info!(url = %req.source_url, error = %e, "Rejected image request");
            }
            e.into_response()
        }
    }
}

/// Runs the optimizer and falls back to the broken-image placeholder when the
/// source is at fault. A failing fallback is final.
async fn serve(state: &AppState, req: &OptimizeRequest) -> Result<OptimizeResponse> {
    match state.optimizer.optimize(req).await {
        Err(e) if e.triggers_fallback() && state.optimizer.has_placeholder() => {
            tracing::warn!(url = %req.source_url, error = %e, "Serving broken image placeholder");
            state.metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
            state
                .optimizer
                .broken_image(req)
                .await
                .map_err(|inner| OptimizerError::Fallback(Box::new(inner)))
        }
        other => other,
    }
}

/// Builds the HTTP response for an optimizer result.
///
/// Every response carries `Date`, `Last-Modified`, `Age`, `Content-Type`,
/// `Cache-Control`, `Content-Security-Policy`, `X-Cache` and `Vary: Accept`.
/// A not-modified result becomes a bodyless 304.
pub fn image_response(resp: &OptimizeResponse, now: OffsetDateTime) -> Response {
    let mut headers = HeaderMap::new();
    let date = |ts| HeaderValue::from_str(&http_date::format(ts)).unwrap_or(HeaderValue::from_static(""));

    headers.insert(header::DATE, date(now));
    headers.insert(header::LAST_MODIFIED, date(resp.created_at));
    headers.insert(header::AGE, HeaderValue::from(resp.age(now)));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&resp.format)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
    headers.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(CONTENT_SECURITY_POLICY));
    headers.insert(
        "x-cache",
        HeaderValue::from_static(if resp.from_cache { "HIT" } else { "MISS" }),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Accept"));

    match &resp.payload {
        Some(body) if !resp.is_not_modified() => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            (StatusCode::OK, headers, Body::from(body.clone())).into_response()
        }
        _ => (StatusCode::NOT_MODIFIED, headers).into_response(),
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imgopt"
    }))
}

/// Metrics endpoint (Prometheus-compatible plain text)
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Builds the service router.
///
/// Routes:
/// - `GET {image_path}`: image optimization (see `OptimizerConfig::image_path`)
/// - `GET /health`: JSON liveness report
/// - `GET /metrics`: request counters in Prometheus text format
///
/// Requests are traced through `tower_http::trace::TraceLayer`.
///
/// # Example
/// ```no_run
/// # async fn run(state: imgopt::AppState) -> std::io::Result<()> {
/// let app = imgopt::router(state);
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// axum::serve(listener, app).await
/// # }
/// ```
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.image_path, get(image_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
