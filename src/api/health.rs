//! Liveness probe for the demo server. It touches nothing that can fail, so
//! container health checks never receive a problem response.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// `GET /healthz`: always `200 OK` with `{"status": "ok"}`.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
