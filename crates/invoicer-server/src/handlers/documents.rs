//! Quotes and invoices: CRUD, line replacement and lifecycle moves.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use invoicer_core::ids::{InvoiceId, QuoteId};
use invoicer_core::status::{InvoiceStatus, QuoteStatus};
use invoicer_core::LineItem;
use invoicer_engine::services::{InvoiceInput, QuoteInput};
use invoicer_store::invoices::InvoiceRow;
use invoicer_store::quotes::QuoteRow;

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::AuthUser;

#[derive(Debug, Deserialize)]
pub struct LinesInput {
    lines: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
pub struct StatusInput<S> {
    status: S,
}

pub async fn list_quotes(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<QuoteRow>>, ApiError> {
    Ok(Json(state.engine.quotes.list(&user.actor())?))
}

pub async fn create_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<QuoteInput>,
) -> Result<(StatusCode, Json<QuoteRow>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.quotes.create(&user.actor(), &input)?)))
}

pub async fn get_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
) -> Result<Json<QuoteRow>, ApiError> {
    Ok(Json(state.engine.quotes.get(&user.actor(), &id)?))
}

pub async fn update_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
    Json(input): Json<QuoteInput>,
) -> Result<Json<QuoteRow>, ApiError> {
    Ok(Json(state.engine.quotes.update(&user.actor(), &id, &input)?))
}

pub async fn replace_quote_lines(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
    Json(input): Json<LinesInput>,
) -> Result<Json<QuoteRow>, ApiError> {
    Ok(Json(state.engine.quotes.replace_lines(&user.actor(), &id, &input.lines)?))
}

pub async fn transition_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
    Json(input): Json<StatusInput<QuoteStatus>>,
) -> Result<Json<QuoteRow>, ApiError> {
    Ok(Json(state.engine.quotes.transition(&user.actor(), &id, input.status)?))
}

pub async fn convert_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
) -> Result<(StatusCode, Json<InvoiceRow>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.quotes.convert(&user.actor(), &id)?)))
}

pub async fn delete_quote(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<QuoteId>,
) -> Result<StatusCode, ApiError> {
    state.engine.quotes.delete(&user.actor(), &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_invoices(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<InvoiceRow>>, ApiError> {
    Ok(Json(state.engine.invoices.list(&user.actor())?))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<InvoiceInput>,
) -> Result<(StatusCode, Json<InvoiceRow>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.invoices.create(&user.actor(), &input)?)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InvoiceId>,
) -> Result<Json<InvoiceRow>, ApiError> {
    Ok(Json(state.engine.invoices.get(&user.actor(), &id)?))
}

pub async fn update_invoice(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InvoiceId>,
    Json(input): Json<InvoiceInput>,
) -> Result<Json<InvoiceRow>, ApiError> {
    Ok(Json(state.engine.invoices.update(&user.actor(), &id, &input)?))
}

pub async fn replace_invoice_lines(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InvoiceId>,
    Json(input): Json<LinesInput>,
) -> Result<Json<InvoiceRow>, ApiError> {
    Ok(Json(state.engine.invoices.replace_lines(&user.actor(), &id, &input.lines)?))
}

pub async fn transition_invoice(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InvoiceId>,
    Json(input): Json<StatusInput<InvoiceStatus>>,
) -> Result<Json<InvoiceRow>, ApiError> {
    Ok(Json(state.engine.invoices.transition(&user.actor(), &id, input.status)?))
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<InvoiceId>,
) -> Result<StatusCode, ApiError> {
    state.engine.invoices.delete(&user.actor(), &id)?;
    Ok(StatusCode::NO_CONTENT)
}
