//! Administrative routes

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use super::Result;
use crate::reload::{ConfigStatus, ReloadOutcome};
use crate::state::AppState;
use crate::upload::UploadError;

/// Create the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/reload-config", post(reload_config))
        .route("/admin/config-status", get(config_status))
}

/// POST /api/admin/reload-config - re-read the hot-reloadable settings
///
/// Sessions already in flight keep the retention they resolved at creation;
/// the new quota ceiling applies from the next admission.
async fn reload_config(State(state): State<AppState>) -> Result<Json<ReloadOutcome>> {
    let outcome = state
        .reloader()
        .reload()
        .map_err(|e| UploadError::BadRequest(e.to_string()))?;

    Ok(Json(outcome))
}

/// GET /api/admin/config-status
async fn config_status(State(state): State<AppState>) -> Json<ConfigStatus> {
    Json(state.reloader().status())
}
