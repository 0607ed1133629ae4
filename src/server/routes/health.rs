//! Unauthenticated liveness check. The OAuth token keepalive helper that
//! would populate `token_expires_at`/`token_expires_in` is an external
//! collaborator; this reports what it can observe locally.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub claude_auth: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_in: Option<i64>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let claude_auth = if std::path::Path::new(&state.config.assistant_path).exists()
        || which_on_path(&state.config.assistant_path)
    {
        "configured"
    } else {
        "unavailable"
    };

    Json(HealthResponse {
        status: "ok",
        claude_auth,
        token_expires_at: None,
        token_expires_in: None,
    })
}

/// A bare executable name (no path separators) is resolved against `PATH`
/// at spawn time by the OS; we can't cheaply verify it without spawning, so
/// treat it as present. Only a path-like value is checked on disk above.
fn which_on_path(executable: &str) -> bool {
    !executable.contains(std::path::MAIN_SEPARATOR)
}
