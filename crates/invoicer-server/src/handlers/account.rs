//! Per-user views: dashboard, notifications, audit trail and exports.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use invoicer_core::ids::NotificationId;
use invoicer_engine::exports::ExportFile;
use invoicer_engine::services::Dashboard;
use invoicer_store::audit::AuditRow;
use invoicer_store::notifications::NotificationRow;

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::AuthUser;

#[derive(Debug, Default, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    unread: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditParams {
    action: Option<String>,
    limit: Option<u32>,
}

pub async fn dashboard(State(state): State<AppState>, user: AuthUser) -> Result<Json<Dashboard>, ApiError> {
    Ok(Json(state.engine.dashboard.summary(&user.actor())?))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthUser,
    Query(q): Query<NotificationQuery>,
) -> Result<Json<Vec<NotificationRow>>, ApiError> {
    Ok(Json(state.engine.notifications.list(&user.actor(), q.unread)?))
}

pub async fn mark_notification_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<NotificationId>,
) -> Result<Json<NotificationRow>, ApiError> {
    Ok(Json(state.engine.notifications.mark_read(&user.actor(), &id)?))
}

pub async fn list_audit(
    State(state): State<AppState>,
    user: AuthUser,
    Query(q): Query<AuditParams>,
) -> Result<Json<Vec<AuditRow>>, ApiError> {
    Ok(Json(state.engine.audit.list(&user.actor(), q.action, q.limit)?))
}

pub async fn export_invoices(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<(StatusCode, Json<ExportFile>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.exports.export_invoices(&user.actor())?)))
}
