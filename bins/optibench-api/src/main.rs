mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use optibench_common::store::RedisJobStore;
use optibench_common::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub store: RedisJobStore,
    pub config: Config,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Optibench API booting...");

    let config = Config::from_env();

    let store = RedisJobStore::connect(&config.redis_url)
        .await
        .expect("Failed to connect to Redis");
    info!("Connected to Redis: {}", config.redis_url);

    let addr = config.listen_addr.clone();
    let state = Arc::new(AppState { store, config });

    // Build router
    let app = Router::new()
        .route("/submit", post(handlers::submit))
        .route("/leaderboard", get(handlers::leaderboard))
        .route("/runs/:id", get(handlers::get_run))
        .route("/status", get(handlers::health_check))
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .with_state(state);

    // Start server
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind to address");

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await.expect("Server error");
}
