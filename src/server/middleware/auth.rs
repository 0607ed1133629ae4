//! `X-API-Key` authentication, compared in constant time against the
//! configured key list. Health and the embedded frontend are mounted outside
//! the router this layer wraps.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::server::app::AppState;

const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(provided) = provided else {
        return unauthorized();
    };

    let matches = state
        .config
        .api_keys
        .iter()
        .any(|key| key.as_bytes().ct_eq(provided.as_bytes()).into());

    if matches {
        next.run(req).await
    } else {
        unauthorized()
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "missing or invalid X-API-Key"})),
    )
        .into_response()
}
