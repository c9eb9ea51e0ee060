use axum::extract::State;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};

use invoicer_core::security::Credentials;
use invoicer_engine::auth::DEFAULT_REDIRECT;
use invoicer_engine::EngineError;

use crate::error::ApiError;
use crate::server::AppState;
use crate::session::{session_cookie, ClientInfo, CurrentSession, SessionRotated, CSRF_FIELD};

#[derive(Deserialize)]
pub struct LoginForm {
    email: String,
    password: String,
}

/// Attach a freshly issued session cookie to `body`.
fn with_new_session(state: &AppState, token: String, body: impl IntoResponse) -> Response {
    let jar = CookieJar::new().add(session_cookie(token, state.config.secure_cookies));
    let mut response = (jar, body).into_response();
    response.extensions_mut().insert(SessionRotated);
    response
}

pub async fn session_info(session: CurrentSession) -> Json<Value> {
    let state = session.state();
    Json(json!({
        "authenticated": state.is_authenticated(),
        "csrf_token": state.csrf_token,
        "user": state.user,
    }))
}

pub async fn login_form(session: CurrentSession) -> Response {
    if session.state().is_authenticated() {
        return Redirect::to(DEFAULT_REDIRECT).into_response();
    }
    Html(format!(
        "<!doctype html><html><head><title>Log in</title></head><body>\
         <form method=\"post\" action=\"/login\">\
         <input type=\"hidden\" name=\"{CSRF_FIELD}\" value=\"{token}\">\
         <label>Email <input type=\"email\" name=\"email\" required></label>\
         <label>Password <input type=\"password\" name=\"password\" required></label>\
         <button type=\"submit\">Log in</button>\
         </form></body></html>",
        token = session.state().csrf_token,
    ))
    .into_response()
}

pub async fn login(
    State(state): State<AppState>,
    session: CurrentSession,
    ClientInfo(ctx): ClientInfo,
    Form(form): Form<LoginForm>,
) -> Result<Response, ApiError> {
    let auth = state.engine.auth.clone();
    let token = session.token().to_string();
    let credentials = Credentials::new(form.email, form.password);
    // argon2 is CPU bound
    let outcome = tokio::task::spawn_blocking(move || auth.login(Some(&token), &credentials, &ctx))
        .await
        .map_err(|e| EngineError::Internal(format!("login task failed: {e}")))??;
    Ok(with_new_session(&state, outcome.session.token, Redirect::to(&outcome.redirect_to)))
}

pub async fn logout(
    State(state): State<AppState>,
    session: CurrentSession,
    ClientInfo(ctx): ClientInfo,
) -> Result<Response, ApiError> {
    let fresh = state.engine.auth.logout(Some(session.token()), &ctx)?;
    Ok(with_new_session(&state, fresh.token, Redirect::to("/")))
}
