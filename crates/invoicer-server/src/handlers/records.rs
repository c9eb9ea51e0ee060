//! Customers and catalogue items.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use invoicer_core::ids::{CustomerId, ItemId};
use invoicer_engine::services::{CustomerInput, ItemInput};
use invoicer_store::customers::CustomerRow;
use invoicer_store::items::ItemRow;

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::AuthUser;

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    search: Option<String>,
}

pub async fn list_customers(
    State(state): State<AppState>,
    user: AuthUser,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<CustomerRow>>, ApiError> {
    Ok(Json(state.engine.customers.list(&user.actor(), q.search.as_deref())?))
}

pub async fn create_customer(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<CustomerInput>,
) -> Result<(StatusCode, Json<CustomerRow>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.customers.create(&user.actor(), &input)?)))
}

pub async fn get_customer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<CustomerId>,
) -> Result<Json<CustomerRow>, ApiError> {
    Ok(Json(state.engine.customers.get(&user.actor(), &id)?))
}

pub async fn update_customer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<CustomerId>,
    Json(input): Json<CustomerInput>,
) -> Result<Json<CustomerRow>, ApiError> {
    Ok(Json(state.engine.customers.update(&user.actor(), &id, &input)?))
}

pub async fn delete_customer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<CustomerId>,
) -> Result<StatusCode, ApiError> {
    state.engine.customers.delete(&user.actor(), &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_items(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<ItemRow>>, ApiError> {
    Ok(Json(state.engine.items.list(&user.actor())?))
}

pub async fn create_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<ItemInput>,
) -> Result<(StatusCode, Json<ItemRow>), ApiError> {
    Ok((StatusCode::CREATED, Json(state.engine.items.create(&user.actor(), &input)?)))
}

pub async fn get_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<ItemId>,
) -> Result<Json<ItemRow>, ApiError> {
    Ok(Json(state.engine.items.get(&user.actor(), &id)?))
}

pub async fn update_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<ItemId>,
    Json(input): Json<ItemInput>,
) -> Result<Json<ItemRow>, ApiError> {
    Ok(Json(state.engine.items.update(&user.actor(), &id, &input)?))
}

pub async fn delete_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<ItemId>,
) -> Result<StatusCode, ApiError> {
    state.engine.items.delete(&user.actor(), &id)?;
    Ok(StatusCode::NO_CONTENT)
}
