//! HTTP API for intervene.
//!
//! `POST /api/run` streams the events of one run as Server-Sent Events. Each
//! frame is a JSON [`RunEvent`](intervene_core::events::RunEvent) and the
//! stream closes after the `done` frame. Requests that are malformed before
//! the run starts get a 4xx with an [`ApiError`] body instead.

mod config;
mod run;

use std::path::PathBuf;

use arc_swap::ArcSwap;
use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use intervene_core::config::Config;
use intervene_core::run::RunSupervisor;

pub use config::{get_config, put_config};
pub use run::{cancel_run, start_run};

/// Shared state behind every handler.
pub struct AppState {
    pub config: ArcSwap<Config>,
    pub config_path: PathBuf,
    pub supervisor: RunSupervisor,
}

impl AppState {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path,
            supervisor: RunSupervisor::new(),
        }
    }
}

/// Body of `POST /api/run`. An empty body runs the configured objective.
#[derive(Serialize, Deserialize, Default)]
pub struct RunRequest {
    #[serde(default)]
    pub objective: Option<String>,
}

/// Structured API error response.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

pub(crate) fn bad_request(message: String) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            code: "bad_request".into(),
            message,
        }),
    )
}

pub(crate) fn internal_error(code: &str, message: String) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            code: code.into(),
            message,
        }),
    )
}
