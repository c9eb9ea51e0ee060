//! HTTP handlers organized by domain.

pub mod account;
pub mod auth;
pub mod documents;
pub mod records;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::ApiError;
use crate::server::AppState;

pub async fn landing() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Invoicer</title></head>\
         <body><h1>Invoicer</h1><p><a href=\"/login\">Log in</a></p></body></html>",
    )
}

/// Liveness plus a trivial database round trip.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = state
        .engine
        .db
        .with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)));
    match db {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))),
        Err(e) => {
            error!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable" })))
        }
    }
}

pub async fn not_found() -> ApiError {
    ApiError::from(invoicer_engine::EngineError::not_found("page"))
}
