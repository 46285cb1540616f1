// Backend proxy server for Adelaide Metro live bus positions
// GTFS-Realtime vehicle positions in, normalized JSON with ETag/stale handling out
//
// Configuration (environment, each with a default):
// - VEHICLE_POSITIONS_URL: upstream GTFS-RT vehicle positions feed
// - ROUTES_JSON_URL: optional route metadata source (empty disables enrichment)
// - PORT: listening port (default 3000)

use actix_cors::Cors;
use actix_files as fs;
use actix_web::http::header;
use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time;

mod feed_models;
use feed_models::{FeedCache, FeedError, FeedModels, Negotiated, RoutesMeta};

#[derive(Clone)]
struct FeedConfig {
    vehicle_positions_url: String,
    routes_json_url: String,
    port: u16,
}

impl FeedConfig {
    fn from_env() -> Self {
        FeedConfig {
            vehicle_positions_url: std::env::var("VEHICLE_POSITIONS_URL")
                .unwrap_or_else(|_| FeedModels::DEFAULT_VEHICLE_POSITIONS_URL.to_string()),
            routes_json_url: std::env::var("ROUTES_JSON_URL").unwrap_or_default(),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
        }
    }
}

#[derive(Clone)]
struct AppState {
    cache: Arc<FeedCache>,
    routes_meta: Arc<RwLock<RoutesMeta>>,
    config: FeedConfig,
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn vehicle_positions(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let url = state.config.vehicle_positions_url.clone();
    let routes_meta = state.routes_meta.clone();

    // Every request re-fetches upstream; there is no request coalescing.
    // The route table is cloned up front so no lock is held across the
    // network call.
    let fetched = match tokio::task::spawn_blocking(move || {
        let routes = match routes_meta.read() {
            Ok(table) => table.clone(),
            Err(e) => {
                eprintln!("❌ Failed to lock routes metadata: {}", e);
                RoutesMeta::new()
            }
        };
        FeedModels::fetch_and_decode(&url, &routes)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => Err(FeedError::NetworkError(format!("Fetch task panicked: {}", e))),
    };

    let outcome = state
        .cache
        .apply_refresh(fetched, FeedModels::current_timestamp_ms());

    let if_none_match = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    match FeedModels::negotiate(outcome, if_none_match) {
        Negotiated::NotModified => HttpResponse::NotModified().finish(),
        Negotiated::Fresh { snapshot } => {
            println!("🚌 Vehicles served: {} fresh", snapshot.vehicles.len());
            HttpResponse::Ok()
                .insert_header((header::ETAG, snapshot.etag.clone()))
                .insert_header((header::CACHE_CONTROL, "no-store"))
                .json(serde_json::json!({
                    "vehicles": snapshot.vehicles,
                    "updated": snapshot.updated_ms,
                }))
        }
        Negotiated::Stale { snapshot } => {
            println!(
                "⚠️  Upstream refresh failed; serving {} stale vehicles",
                snapshot.vehicles.len()
            );
            HttpResponse::Ok()
                .insert_header((header::CACHE_CONTROL, "no-store"))
                .json(serde_json::json!({
                    "vehicles": snapshot.vehicles,
                    "updated": snapshot.updated_ms,
                    "stale": true,
                }))
        }
        Negotiated::Error { error } => {
            eprintln!("❌ Vehicle positions refresh failed: {}", error);
            HttpResponse::BadGateway().json(serde_json::json!({
                "error": "Failed to fetch or parse GTFS-RT feed",
            }))
        }
    }
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "ok": true }))
}

// ============================================================================
// Background Task
// ============================================================================

async fn routes_refresh_task(routes_meta: Arc<RwLock<RoutesMeta>>, url: String) {
    let mut interval = time::interval(Duration::from_secs(
        FeedModels::ROUTES_REFRESH_INTERVAL_SECS,
    ));

    // The first tick completes immediately, covering the startup load
    loop {
        interval.tick().await;

        let fetch_url = url.clone();
        match tokio::task::spawn_blocking(move || FeedModels::load_routes_meta(&fetch_url)).await {
            Ok(Ok(loaded)) => {
                let count = loaded.len();
                match routes_meta.write() {
                    Ok(mut table) => {
                        *table = loaded;
                        println!("✓ Loaded routes metadata from {} ({} routes)", url, count);
                    }
                    Err(e) => eprintln!("❌ Failed to lock routes metadata: {}", e),
                }
            }
            Ok(Err(e)) => eprintln!("⚠️  Warning: Could not load routes metadata ({})", e),
            Err(e) => eprintln!("❌ Routes metadata task panicked: {}", e),
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: FeedConfig) -> std::io::Result<()> {
    let app_state = AppState {
        cache: Arc::new(FeedCache::new()),
        routes_meta: Arc::new(RwLock::new(RoutesMeta::new())),
        config: config.clone(),
    };

    let routes_task = if config.routes_json_url.is_empty() {
        None
    } else {
        let routes_meta = app_state.routes_meta.clone();
        let url = config.routes_json_url.clone();
        Some(tokio::spawn(async move {
            routes_refresh_task(routes_meta, url).await;
        }))
    };

    println!("🌐 Server running on: http://0.0.0.0:{}", config.port);
    println!("📡 Upstream feed: {}", config.vehicle_positions_url);
    if config.routes_json_url.is_empty() {
        println!("ℹ️  ROUTES_JSON_URL not set; route enrichment disabled");
    } else {
        println!(
            "🎨 Route metadata: {} (refreshed every {} min)",
            config.routes_json_url,
            FeedModels::ROUTES_REFRESH_INTERVAL_SECS / 60
        );
    }

    println!("📍 Available Routes:");
    println!("   GET  /api/vehicle_positions.json  - Live vehicle positions");
    println!("   GET  /healthz                     - Health check");
    println!("   GET  /                            - Static frontend (./public)");

    let port = config.port;
    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route(
                "/api/vehicle_positions.json",
                web::get().to(vehicle_positions),
            )
            .route("/healthz", web::get().to(healthz))
            .service(fs::Files::new("/", "public").index_file("index.html"))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    // The metadata refresher stops with the server
    if let Some(task) = routes_task {
        task.abort();
    }

    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("🚍 Adelaide Buses Live v1.1");

    let config = FeedConfig::from_env();
    actix_web::rt::System::new().block_on(run_server(config))
}

// ============================================================================
// Tests
// ============================================================================
