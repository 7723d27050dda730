use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image optimizer.
///
/// Mixes first-time variants (cache misses), a fixed hot variant (cache hits),
/// conditional revalidation and health checks. Sources come from
/// `LOADTEST_SOURCE`, which must match `AUTHORIZED_HOSTNAMES` on the server.
///
/// # Usage
/// ```bash
/// cd loadtest
/// LOADTEST_SOURCE=https://picsum.photos/2000/2000 \
///   cargo run --release -- --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Cache hits and 304s: <20ms p95 latency
/// - Cache misses: <200ms p95 latency (WebP) / <400ms (AVIF)
/// - Error rate: <1%

const ACCEPT_WEBP: &str = "image/webp,image/*,*/*;q=0.8";
const ACCEPT_AVIF: &str = "image/avif,image/*,*/*;q=0.8";

fn source() -> String {
    std::env::var("LOADTEST_SOURCE").unwrap_or_else(|_| "https://picsum.photos/2000/2000".to_string())
}

fn image_path(w: u32, h: u32, q: u8) -> String {
    format!("/image?url={}&w={}&h={}&q={}", source(), w, h, q)
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("Optimization")
                .register_transaction(transaction!(random_variant).set_weight(10)?)
                .register_transaction(transaction!(health_check).set_weight(1)?),
        )
        .register_scenario(
            scenario!("CachePerformance")
                .register_transaction(transaction!(hot_variant).set_weight(15)?)
                .register_transaction(transaction!(revalidate_hot_variant).set_weight(5)?)
                .register_transaction(transaction!(unique_variant).set_weight(5)?),
        )
        .execute()
        .await?;

    Ok(())
}

/// Random size, quality and Accept header spread load across cache keys.
async fn random_variant(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let (path, accept) = {
        let mut rng = rand::thread_rng();
        let w = rng.gen_range(100..1000);
        let h = rng.gen_range(0..1000);
        let q = rng.gen_range(40..=90);
        let accept = if rng.gen_bool(0.5) { ACCEPT_WEBP } else { ACCEPT_AVIF };
        (image_path(w, h, q), accept)
    };

    let request = user.get_request_builder(&GooseMethod::Get, &path)?.header("Accept", accept);
    let goose_request = GooseRequest::builder().set_request_builder(request).build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}

/// Fixed parameters hit the cache after the first request.
async fn hot_variant(user: &mut GooseUser) -> TransactionResult {
    let request = user
        .get_request_builder(&GooseMethod::Get, &image_path(500, 500, 80))?
        .header("Accept", ACCEPT_WEBP);
    let goose_request = GooseRequest::builder().set_request_builder(request).build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}

/// Conditional request for the hot variant; expected to answer 304.
async fn revalidate_hot_variant(user: &mut GooseUser) -> TransactionResult {
    let since = (chrono::Utc::now() - chrono::Duration::hours(1))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    let request = user
        .get_request_builder(&GooseMethod::Get, &image_path(500, 500, 80))?
        .header("Accept", ACCEPT_WEBP)
        .header("If-Modified-Since", since)
        .header("Cache-Control", "max-age=0");
    let goose_request = GooseRequest::builder()
        .set_request_builder(request)
        .expect_status_code(304)
        .build();
    let _goose = user.request(goose_request).await?;
    Ok(())
}

/// Timestamp-derived dimensions guarantee cache misses.
async fn unique_variant(user: &mut GooseUser) -> TransactionResult {
    let timestamp = chrono::Utc::now().timestamp();
    let w = 200 + (timestamp % 100) as u32;
    let h = 200 + ((timestamp / 100) % 100) as u32;

    let _goose = user.get(&image_path(w, h, 75)).await?;
    Ok(())
}

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
