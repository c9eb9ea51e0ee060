use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use invoicer_engine::Engine;
use invoicer_settings::ServerSettings;

use crate::handlers::{self, account, auth, documents, records};
use crate::security::{request_id, security_headers, REQUEST_ID};
use crate::session::session_middleware;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub trust_forwarded_proto: bool,
    pub secure_cookies: bool,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            trust_forwarded_proto: settings.trust_forwarded_proto,
            secure_cookies: settings.secure_cookies,
            request_timeout_secs: settings.request_timeout_secs,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(engine: Engine, config: ServerConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    Router::new()
        .route("/", get(handlers::landing))
        .route("/health", get(handlers::health))
        .route("/session", get(auth::session_info))
        .route("/login", get(auth::login_form).post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/dashboard", get(account::dashboard))
        .route("/customers", get(records::list_customers).post(records::create_customer))
        .route(
            "/customers/{id}",
            get(records::get_customer)
                .put(records::update_customer)
                .delete(records::delete_customer),
        )
        .route("/items", get(records::list_items).post(records::create_item))
        .route(
            "/items/{id}",
            get(records::get_item).put(records::update_item).delete(records::delete_item),
        )
        .route("/quotes", get(documents::list_quotes).post(documents::create_quote))
        .route(
            "/quotes/{id}",
            get(documents::get_quote)
                .put(documents::update_quote)
                .delete(documents::delete_quote),
        )
        .route("/quotes/{id}/lines", put(documents::replace_quote_lines))
        .route("/quotes/{id}/status", post(documents::transition_quote))
        .route("/quotes/{id}/convert", post(documents::convert_quote))
        .route("/invoices", get(documents::list_invoices).post(documents::create_invoice))
        .route(
            "/invoices/{id}",
            get(documents::get_invoice)
                .put(documents::update_invoice)
                .delete(documents::delete_invoice),
        )
        .route("/invoices/{id}/lines", put(documents::replace_invoice_lines))
        .route("/invoices/{id}/status", post(documents::transition_invoice))
        .route("/notifications", get(account::list_notifications))
        .route("/notifications/{id}/read", post(account::mark_notification_read))
        .route("/audit", get(account::list_audit))
        .route("/exports/invoices", post(account::export_invoices))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), session_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
            let request_id = req
                .headers()
                .get(&REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!("http", method = %req.method(), path = %req.uri().path(), request_id)
        }))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Bind and serve until [`ServerHandle::shutdown`] is called.
pub async fn start(config: ServerConfig, engine: Engine) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let router = build_router(AppState::new(engine, config));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "invoicer server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.server).await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}
