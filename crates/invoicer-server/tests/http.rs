//! End-to-end HTTP tests driven through the router with `tower::oneshot`.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use invoicer_core::policy::Actor;
use invoicer_core::security::Password;
use invoicer_engine::auth::AuthenticatedUser;
use invoicer_engine::Engine;
use invoicer_server::{build_router, AppState, ServerConfig};
use invoicer_settings::Settings;
use invoicer_store::Database;

const PASSWORD: &str = "correct horse";

struct Harness {
    app: Router,
    engine: Engine,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    fn with_config(config: ServerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.pdf_dir = dir.path().join("pdfs");
        settings.storage.export_dir = dir.path().join("exports");
        settings.storage.temp_dir = dir.path().join("temp");
        settings.retention.lock_path = dir.path().join("retention.lock");
        settings.billing.tax_rate_bps = 1000;

        let mut engine = Engine::new(Database::in_memory().unwrap(), &settings);
        engine.auth = engine.auth.with_hash_params(argon2::Params::new(8, 1, 1, None).unwrap());
        let app = build_router(AppState::new(engine.clone(), config));
        Self { app, engine, _dir: dir }
    }

    fn register(&self, email: &str) -> AuthenticatedUser {
        self.engine
            .auth
            .register(email, "Test User", &Password::new(PASSWORD), false)
            .unwrap()
    }

    async fn send(&self, req: Request<Body>) -> Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    /// Anonymous session cookie plus its anti-forgery token.
    async fn anonymous(&self) -> Client {
        let resp = self.send(Request::get("/session").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = session_cookie(&resp).expect("anonymous session issued");
        let body = json_body(resp).await;
        Client {
            cookie,
            csrf: body["csrf_token"].as_str().unwrap().to_string(),
        }
    }

    async fn login(&self, email: &str, password: &str) -> (Response, Client) {
        let client = self.anonymous().await;
        let form = format!(
            "email={}&password={}&_token={}",
            email.replace('@', "%40"),
            password.replace(' ', "+"),
            client.csrf
        );
        let req = Request::post("/login")
            .header(header::COOKIE, &client.cookie)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        (self.send(req).await, client)
    }

    /// Log in and refresh the csrf token of the rotated session.
    async fn signed_in(&self, email: &str) -> Client {
        let (resp, _) = self.login(email, PASSWORD).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let cookie = session_cookie(&resp).expect("rotated session");
        let req = Request::get("/session")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let body = json_body(self.send(req).await).await;
        assert_eq!(body["authenticated"], true);
        Client {
            cookie,
            csrf: body["csrf_token"].as_str().unwrap().to_string(),
        }
    }
}

struct Client {
    cookie: String,
    csrf: String,
}

impl Client {
    fn get(&self, uri: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::COOKIE, &self.cookie)
            .body(Body::empty())
            .unwrap()
    }

    fn json(&self, method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, &self.cookie)
            .header("x-csrf-token", &self.csrf)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

fn session_cookie(resp: &Response) -> Option<String> {
    resp.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("invoicer_session="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

fn assert_hardened(resp: &Response) {
    let headers = resp.headers();
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("referrer-policy"));
    assert!(!headers.contains_key("server"));
}

async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let h = Harness::new();
    let resp = h.send(Request::get("/").body(Body::empty()).unwrap()).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_hardened(&resp);
    assert!(!resp.headers().contains_key("strict-transport-security"));
}

#[tokio::test]
async fn rejections_carry_security_headers() {
    let h = Harness::new();
    h.register("ann@example.com");

    let unauthenticated = h.send(Request::get("/customers").body(Body::empty()).unwrap()).await;
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
    assert_hardened(&unauthenticated);

    let client = h.signed_in("ann@example.com").await;
    let forged = Client {
        cookie: client.cookie.clone(),
        csrf: "forged".into(),
    };
    let csrf = h.send(forged.json("POST", "/customers", json!({"name": "Acme"}))).await;
    assert_eq!(csrf.status(), StatusCode::FORBIDDEN);
    assert_hardened(&csrf);
}

#[tokio::test]
async fn forwarded_https_gets_hsts_only_behind_a_trusted_proxy() {
    let forwarded = || {
        Request::get("/")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap()
    };

    let untrusted = Harness::new().send(forwarded()).await;
    assert_hardened(&untrusted);
    assert!(!untrusted.headers().contains_key("strict-transport-security"));

    let proxied = Harness::with_config(ServerConfig {
        trust_forwarded_proto: true,
        ..ServerConfig::default()
    });
    let resp = proxied.send(forwarded()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_hardened(&resp);
    assert_eq!(resp.headers()["strict-transport-security"], "max-age=31536000; includeSubDomains");
}

#[tokio::test]
async fn anonymous_requests_are_rejected() {
    let h = Harness::new();
    let resp = h.send(Request::get("/customers").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["message"], "Unauthenticated.");
}

#[tokio::test]
async fn login_rotates_session_and_audits_once() {
    let h = Harness::new();
    let user = h.register("ann@example.com");

    let (resp, before) = h.login("ann@example.com", PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(resp.headers()[header::LOCATION], "/dashboard");
    let after = session_cookie(&resp).unwrap();
    assert_ne!(after, before.cookie);

    // the pre-login session no longer authenticates
    let stale = h.send(before.get("/dashboard")).await;
    assert_eq!(stale.status(), StatusCode::UNAUTHORIZED);

    let rows = h
        .engine
        .audit
        .list(&Actor::user(user.id.clone()), Some("auth.login".into()), None)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].actor_id.as_ref(), Some(&user.id));
}

#[tokio::test]
async fn failed_login_is_generic_and_audited() {
    let h = Harness::new();
    let admin = h
        .engine
        .auth
        .register("root@example.com", "Root", &Password::new(PASSWORD), true)
        .unwrap();
    h.register("ann@example.com");

    let (wrong_password, client) = h.login("ann@example.com", "not the password").await;
    assert_eq!(wrong_password.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let wrong_password = json_body(wrong_password).await;

    let (unknown_user, _) = h.login("ghost@example.com", PASSWORD).await;
    assert_eq!(json_body(unknown_user).await, wrong_password);

    let session = json_body(h.send(client.get("/session")).await).await;
    assert_eq!(session["authenticated"], false);

    let failures = h
        .engine
        .audit
        .list(&Actor::admin(admin.id), Some("auth.login_failed".into()), None)
        .unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|row| row.actor_id.is_none()));
}

#[tokio::test]
async fn intended_url_survives_login() {
    let h = Harness::new();
    h.register("ann@example.com");
    let client = h.anonymous().await;

    let resp = h.send(client.get("/invoices?page=2")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let form = format!("email=ann%40example.com&password=correct+horse&_token={}", client.csrf);
    let req = Request::post("/login")
        .header(header::COOKIE, &client.cookie)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.headers()[header::LOCATION], "/invoices?page=2");
}

#[tokio::test]
async fn mutations_require_csrf_token() {
    let h = Harness::new();
    h.register("ann@example.com");
    let client = h.signed_in("ann@example.com").await;

    let missing = Request::post("/customers")
        .header(header::COOKIE, &client.cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"name": "Acme"}).to_string()))
        .unwrap();
    let resp = h.send(missing).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(resp).await["message"], "CSRF token mismatch.");

    let forged = Client {
        cookie: client.cookie.clone(),
        csrf: "forged".into(),
    };
    let resp = h.send(forged.json("POST", "/customers", json!({"name": "Acme"}))).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = h.send(client.json("POST", "/customers", json!({"name": "Acme"}))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn other_users_records_are_forbidden() {
    let h = Harness::new();
    h.register("ann@example.com");
    h.register("bob@example.com");
    let ann = h.signed_in("ann@example.com").await;
    let bob = h.signed_in("bob@example.com").await;

    let resp = h
        .send(ann.json("POST", "/items", json!({"name": "Widget", "unit_price": 1500})))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let item = json_body(resp).await;
    let uri = format!("/items/{}", item["id"].as_str().unwrap());

    assert_eq!(h.send(bob.get(&uri)).await.status(), StatusCode::FORBIDDEN);
    let resp = h
        .send(bob.json("PUT", &uri, json!({"name": "Mine now", "unit_price": 1})))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(resp).await["message"], "This action is unauthorized.");

    let bobs_items = json_body(h.send(bob.get("/items")).await).await;
    assert_eq!(bobs_items.as_array().unwrap().len(), 0);
    assert_eq!(h.send(ann.get(&uri)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_input_reports_field_errors() {
    let h = Harness::new();
    h.register("ann@example.com");
    let ann = h.signed_in("ann@example.com").await;

    let resp = h.send(ann.json("POST", "/customers", json!({"name": "  "}))).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(resp).await;
    assert!(body["errors"]["name"].is_array());
}

#[tokio::test]
async fn invoice_lifecycle_over_http() {
    let h = Harness::new();
    h.register("ann@example.com");
    let ann = h.signed_in("ann@example.com").await;

    let customer = json_body(h.send(ann.json("POST", "/customers", json!({"name": "Acme"}))).await).await;
    let resp = h
        .send(ann.json(
            "POST",
            "/invoices",
            json!({
                "customer_id": customer["id"],
                "lines": [{"description": "Design", "unit_price": 2500, "quantity": 2}],
            }),
        ))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let invoice = json_body(resp).await;
    assert_eq!(invoice["totals"]["total"], 5500);
    let id = invoice["id"].as_str().unwrap();
    let status_uri = format!("/invoices/{id}/status");

    // draft invoices cannot be paid directly
    let resp = h.send(ann.json("POST", &status_uri, json!({"status": "paid"}))).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    for status in ["sent", "overdue"] {
        let resp = h.send(ann.json("POST", &status_uri, json!({"status": status}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = h
        .send(ann.json("PUT", &format!("/invoices/{id}/lines"), json!({"lines": []})))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let unread = json_body(h.send(ann.get("/notifications?unread=true")).await).await;
    let unread = unread.as_array().unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0]["kind"], "invoice.overdue");

    let read_uri = format!("/notifications/{}/read", unread[0]["id"].as_str().unwrap());
    let resp = h.send(ann.json("POST", &read_uri, json!({}))).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let dashboard = json_body(h.send(ann.get("/dashboard")).await).await;
    assert_eq!(dashboard["outstanding"], 5500);
    assert_eq!(dashboard["unread_notifications"], 0);
}

#[tokio::test]
async fn export_writes_only_own_invoices() {
    let h = Harness::new();
    h.register("ann@example.com");
    let ann = h.signed_in("ann@example.com").await;

    let customer = json_body(h.send(ann.json("POST", "/customers", json!({"name": "Acme"}))).await).await;
    h.send(ann.json("POST", "/invoices", json!({"customer_id": customer["id"]})))
        .await;

    let resp = h.send(ann.json("POST", "/exports/invoices", json!({}))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let export = json_body(resp).await;
    assert_eq!(export["invoices"], 1);
    let path = std::path::PathBuf::from(export["path"].as_str().unwrap());
    assert!(path.exists());
}

#[tokio::test]
async fn logout_returns_to_anonymous_session() {
    let h = Harness::new();
    h.register("ann@example.com");
    let ann = h.signed_in("ann@example.com").await;

    let req = Request::post("/logout")
        .header(header::COOKIE, &ann.cookie)
        .header("x-csrf-token", &ann.csrf)
        .body(Body::empty())
        .unwrap();
    let resp = h.send(req).await;
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    let fresh = session_cookie(&resp).unwrap();
    assert_ne!(fresh, ann.cookie);

    assert_eq!(h.send(ann.get("/dashboard")).await.status(), StatusCode::UNAUTHORIZED);
}
