use std::net::SocketAddr;
use std::sync::Arc;

use imgopt::cache::build_store;
use imgopt::config::OptimizerConfig;
use imgopt::fetch::{load_placeholder, SourceFetcher};
use imgopt::optimizer::Optimizer;
use imgopt::transform::ImageTransformer;
use imgopt::{router, AppState};

/// Image optimizer server entry point.
///
/// Initializes tracing, loads and validates configuration, builds the cache
/// backend and optional broken-image placeholder, then serves until Ctrl-C.
///
/// # Configuration
/// Environment variables (a `.env` file is loaded first when present):
/// - `API_PORT`: HTTP listen port (default: 8080)
/// - `IMAGE_API_PATH`: route of the image endpoint (default: `/image`)
/// - `DEFAULT_QUALITY`: quality used when `q` is missing or invalid (default: 80)
/// - `MAX_IMAGE_SIZE`: source size limit, e.g. `512KB`, `8MB` (default: 8MB)
/// - `IMAGE_DOWNLOAD_TIMEOUT`: seconds per source request, at least 1 (default: 1)
/// - `AUTHORIZED_HOSTNAMES`: regex every source host must match (default: any)
/// - `BROKEN_IMAGE_PATH`: local path or http(s) URL of the placeholder image
/// - `CACHE_TYPE`: `file`, `in-memory`, `redis` or `memcache` (default: `file`)
/// - `CACHE_PATH`: root directory for the file cache (default: `./cache`)
/// - `CACHE_EXPIRATION`: entry lifetime in minutes, 0 keeps forever
/// - `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`
/// - `MEMCACHE_HOST`, `MEMCACHE_PORT`, `MEMCACHE_USERNAME`, `MEMCACHE_PASSWORD`
/// - `RUST_LOG`: logging verbosity (default: "imgopt=info,tower_http=info")
///
/// # Errors
/// Returns early on invalid configuration, an unreachable cache backend, an
/// unloadable placeholder, or a port that cannot be bound.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imgopt=info,tower_http=info".into()),
        )
        .init();

    tracing::info!("Initializing image optimizer");
    let cfg = OptimizerConfig::from_env()?;

    tracing::info!(bytes = cfg.max_image_size, "Max image size");
    tracing::info!(seconds = cfg.fetch_timeout.as_secs(), "Image download timeout");
    tracing::info!(cache = cfg.cache.name(), "Cache type");
    tracing::info!(path = %cfg.image_path, "Image API path");

    // One HTTP client for source fetches and the placeholder download
    let client = reqwest::Client::new();
    let store = build_store(&cfg.cache).await?;
    let mut optimizer = Optimizer::new(store, Arc::new(ImageTransformer))
        .with_fetcher(SourceFetcher::new(client.clone()));

    if let Some(source) = &cfg.broken_image_source {
        let placeholder = load_placeholder(&client, source)
            .await
            .map_err(|e| format!("Error loading broken image {source}: {e}"))?;
        tracing::info!(source = %source, bytes = placeholder.len(), "Broken image loaded");
        optimizer = optimizer.with_placeholder(placeholder);
    }

    // Bind to 0.0.0.0 for external access (required for containerized deployment)
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = router(AppState::new(optimizer, cfg));

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
