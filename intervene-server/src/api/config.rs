use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use intervene_core::config::Config;

use super::{ApiError, AppState, internal_error};

const REDACTED: &str = "********";

/// Write `content` to a temp file next to `path`, then rename it into place.
fn atomic_write(path: &Path, content: &str) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| "config path has no parent directory".to_string())?;
    let tmp_path = parent.join(".intervene.toml.tmp");
    std::fs::write(&tmp_path, content).map_err(|e| format!("failed to write temp file: {e}"))?;
    std::fs::rename(&tmp_path, path).map_err(|e| format!("failed to rename temp file: {e}"))?;
    Ok(())
}

/// Put back any inline secret the client echoed in redacted form.
fn restore_secrets(incoming: &mut Config, current: &Config) {
    if incoming.openai.api_key.as_deref() == Some(REDACTED) {
        incoming.openai.api_key = current.openai.api_key.clone();
    }
    let pinecone = &mut incoming.vector_store.pinecone;
    if pinecone.api_key.as_deref() == Some(REDACTED) {
        pinecone.api_key = current.vector_store.pinecone.api_key.clone();
    }
}

/// `GET /api/config` returns the current config with inline keys redacted.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.load().redacted())
}

/// `PUT /api/config` replaces the whole config.
///
/// The new config must pass validation. It is written to disk before it is
/// swapped in, so a failed write leaves the running config untouched.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(mut incoming): Json<Config>,
) -> axum::response::Response {
    let current = state.config.load_full();
    restore_secrets(&mut incoming, &current);

    if let Err(e) = incoming.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                code: "invalid_config".into(),
                message: e.to_string(),
            }),
        )
            .into_response();
    }

    let toml = match incoming.to_toml_string() {
        Ok(toml) => toml,
        Err(e) => return internal_error("serialize_error", e.to_string()).into_response(),
    };
    if let Err(e) = atomic_write(&state.config_path, &toml) {
        return internal_error("write_error", e).into_response();
    }

    log::info!("config updated at {}", state.config_path.display());
    let redacted = incoming.redacted();
    state.config.store(Arc::new(incoming));
    Json(redacted).into_response()
}
