//! Session cookie, anti-forgery check and the authenticated-user extractor.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::request::Parts;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Form;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use tracing::{debug, warn};

use invoicer_core::audit::RequestContext;
use invoicer_core::policy::Actor;
use invoicer_engine::auth::{csrf_matches, AuthenticatedUser, SessionHandle, SessionState};

use crate::error::ApiError;
use crate::server::AppState;

pub const SESSION_COOKIE: &str = "invoicer_session";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FIELD: &str = "_token";

const FORM_LIMIT: usize = 64 * 1024;

/// The session resolved for this request.
#[derive(Clone, Debug)]
pub struct CurrentSession(pub Arc<SessionHandle>);

impl CurrentSession {
    pub fn state(&self) -> &SessionState {
        &self.0.state
    }

    pub fn token(&self) -> &str {
        &self.0.token
    }
}

/// Response extension set by handlers that issue their own session cookie
/// (login, logout).
#[derive(Clone, Copy, Debug)]
pub struct SessionRotated;

pub fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .build()
}

fn is_mutating(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn form_content_type(req: &Request) -> Option<HeaderValue> {
    req.headers()
        .get(header::CONTENT_TYPE)
        .filter(|v| v.to_str().is_ok_and(|ct| ct.starts_with("application/x-www-form-urlencoded")))
        .cloned()
}

#[derive(Deserialize)]
struct CsrfField {
    #[serde(rename = "_token")]
    token: String,
}

/// Decode the `_token` field from an already buffered form body.
async fn form_token(content_type: HeaderValue, body: Bytes) -> Option<String> {
    let req = axum::http::Request::builder()
        .method(Method::POST)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .ok()?;
    let Form(field) = Form::<CsrfField>::from_request(req, &()).await.ok()?;
    Some(field.token)
}

/// Mutating requests must echo the session's anti-forgery token, in the
/// `X-CSRF-Token` header or, for form posts, the `_token` field.
async fn verify_csrf(req: Request, expected: &str) -> Result<Request, ApiError> {
    if let Some(submitted) = req.headers().get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
        return if csrf_matches(expected, submitted) {
            Ok(req)
        } else {
            Err(ApiError::CsrfMismatch)
        };
    }
    let Some(content_type) = form_content_type(&req) else {
        return Err(ApiError::CsrfMismatch);
    };
    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, FORM_LIMIT)
        .await
        .map_err(|_| ApiError::BadRequest("form body too large".into()))?;
    match form_token(content_type, bytes.clone()).await {
        Some(submitted) if csrf_matches(expected, &submitted) => Ok(Request::from_parts(parts, Body::from(bytes))),
        _ => Err(ApiError::CsrfMismatch),
    }
}

pub async fn session_middleware(State(state): State<AppState>, jar: CookieJar, req: Request, next: Next) -> Response {
    let token = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    let handle = match state.engine.auth.resolve(token.as_deref()) {
        Ok(handle) => Arc::new(handle),
        Err(e) => return ApiError::from(e).into_response(),
    };

    let mut response = if is_mutating(req.method()) {
        match verify_csrf(req, &handle.state.csrf_token).await {
            Ok(req) => run(req, &handle, next).await,
            Err(e) => {
                debug!("rejected request without a valid anti-forgery token");
                e.into_response()
            }
        }
    } else {
        run(req, &handle, next).await
    };

    if handle.issued && response.extensions().get::<SessionRotated>().is_none() {
        let cookie = session_cookie(handle.token.clone(), state.config.secure_cookies);
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "unencodable session cookie"),
        }
    }
    response
}

async fn run(mut req: Request, handle: &Arc<SessionHandle>, next: Next) -> Response {
    req.extensions_mut().insert(CurrentSession(handle.clone()));
    next.run(req).await
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Rejects anonymous requests with 401. A rejected `GET` remembers its URL
/// so login can return there.
#[derive(Clone, Debug)]
pub struct AuthUser(pub AuthenticatedUser);

impl AuthUser {
    pub fn actor(&self) -> Actor {
        self.0.actor()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = CurrentSession::from_request_parts(parts, state).await?;
        if let Some(user) = &session.state().user {
            return Ok(Self(user.clone()));
        }
        if parts.method == Method::GET {
            let url = parts.uri.path_and_query().map_or("/", |p| p.as_str());
            if let Err(e) = state.engine.auth.remember_intended(session.state(), url) {
                warn!(error = %e, "could not remember intended url");
            }
        }
        Err(ApiError::Unauthenticated)
    }
}

/// Client address and user agent for the audit log.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo(pub RequestContext);

impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.chars().take(512).collect());
        Ok(Self(RequestContext { ip, user_agent }))
    }
}
