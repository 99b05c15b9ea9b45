use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::signal;
use tower_http::services::ServeDir;

mod api;
mod config;
#[cfg(test)]
mod testutil;

use api::AppState;

const STATIC_DIR: &str = "frontend/dist";

/// Build the router. Anything not under `/api` is served from `static_dir`.
pub fn app(state: Arc<AppState>, static_dir: &str) -> Router {
    Router::new()
        .route("/api/run", post(api::start_run).delete(api::cancel_run))
        .route("/api/config", get(api::get_config).put(api::put_config))
        .with_state(state)
        .fallback_service(ServeDir::new(static_dir))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, config_path) = config::load().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let addr = config.bind_address();
    let backend = config.vector_store.backend;
    let openapi_count = config.openapis.len();
    let state = Arc::new(AppState::new(config, config_path.clone()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to bind to {addr}: {e}");
            std::process::exit(1);
        });

    println!("intervene server started");
    println!("  address:  http://{addr}");
    println!("  config:   {}", config_path.display());
    println!("  backend:  {backend}");
    println!("  openapis: {openapi_count}");

    axum::serve(listener, app(state, STATIC_DIR))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: server error: {e}");
            std::process::exit(1);
        });

    println!("intervene server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        log::error!("failed to install ctrl-c handler: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("shutdown signal received");
}
