//! Session and authentication gateway.
//!
//! Every visitor holds a server-side session identified by an opaque cookie
//! token. Only the SHA-256 of the token is stored. A login replaces the
//! session outright, so a token planted before login is worthless after it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::{Arc, OnceLock};

use argon2::Params;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use invoicer_core::audit::{actions, NewAuditEntry, RequestContext};
use invoicer_core::ids::UserId;
use invoicer_core::policy::Actor;
use invoicer_core::security::{normalize_email, Credentials, Password};
use invoicer_store::users::{UserRepo, UserRow};
use invoicer_store::web_sessions::{WebSessionRepo, WebSessionRow};
use invoicer_store::Database;

use crate::audit::AuditRecorder;
use crate::error::EngineError;
use crate::passwords::{hash_password, verify_password};

/// Where a successful login lands when no protected page was requested.
pub const DEFAULT_REDIRECT: &str = "/dashboard";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
}

impl AuthenticatedUser {
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: self.id.clone(),
            is_admin: self.is_admin,
        }
    }
}

impl From<UserRow> for AuthenticatedUser {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            name: row.name,
            is_admin: row.is_admin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionState {
    pub token_hash: String,
    pub user: Option<AuthenticatedUser>,
    pub csrf_token: String,
    pub intended_url: Option<String>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// A session plus the raw token to hand back in the cookie.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub token: String,
    pub state: SessionState,
    /// The token differs from the one the request carried.
    pub issued: bool,
}

#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub session: SessionHandle,
    pub user: AuthenticatedUser,
    pub redirect_to: String,
}

#[derive(Clone)]
pub struct AuthGateway {
    db: Database,
    ttl: Duration,
    params: Params,
    dummy_hash: Arc<OnceLock<Option<String>>>,
}

impl AuthGateway {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            params: Params::default(),
            dummy_hash: Arc::new(OnceLock::new()),
        }
    }

    /// Override the argon2 cost used for new hashes.
    pub fn with_hash_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Burn one verification's worth of work for an unknown email so timing
    /// does not reveal whether the account exists.
    fn dummy_verify(&self, password: &Password) {
        let hash = self
            .dummy_hash
            .get_or_init(|| hash_password(&Password::new("invoicer-dummy-password"), self.params.clone()).ok());
        if let Some(hash) = hash {
            let _ = verify_password(password, hash);
        }
    }

    /// Load the session for `token`, or start a fresh anonymous one when the
    /// token is absent, unknown or idle past the TTL.
    pub fn resolve(&self, token: Option<&str>) -> Result<SessionHandle, EngineError> {
        self.db.with_tx(|tx| {
            if let Some(token) = token {
                let hash = token_hash(token);
                if let Some(row) = WebSessionRepo::get(tx, &hash)? {
                    if row.last_seen_at >= self.idle_cutoff() {
                        WebSessionRepo::touch(tx, &hash)?;
                        return Ok(SessionHandle {
                            token: token.to_string(),
                            state: load_state(tx, row)?,
                            issued: false,
                        });
                    }
                    WebSessionRepo::delete(tx, &hash)?;
                }
            }
            start_session(tx, None, None)
        })
    }

    /// Remember where an anonymous visitor was heading. Only same-site paths
    /// are kept.
    pub fn remember_intended(&self, session: &SessionState, url: &str) -> Result<(), EngineError> {
        if !is_local_path(url) {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            WebSessionRepo::set_intended_url(conn, &session.token_hash, Some(url))?;
            Ok(())
        })
    }

    /// Authenticate `credentials`. On success the current session is
    /// destroyed and a new one issued; on failure the current session is left
    /// untouched and a single failure is audited under the submitted email.
    #[instrument(skip_all, fields(email = %credentials.normalized_email()))]
    pub fn login(
        &self,
        current_token: Option<&str>,
        credentials: &Credentials,
        ctx: &RequestContext,
    ) -> Result<LoginOutcome, EngineError> {
        let email = credentials.normalized_email();
        let found = self.db.with_conn(|conn| UserRepo::get_by_email(conn, &email))?;

        // argon2 runs outside the database lock
        let user = match found {
            Some(user) if verify_password(&credentials.password, &user.password_hash) => user,
            Some(_) => return Err(self.fail_login(&email, ctx)),
            None => {
                self.dummy_verify(&credentials.password);
                return Err(self.fail_login(&email, ctx));
            }
        };

        let outcome = self.db.with_tx(|tx| {
            let intended = match current_token {
                Some(token) => {
                    let hash = token_hash(token);
                    let old = WebSessionRepo::get(tx, &hash)?;
                    WebSessionRepo::delete(tx, &hash)?;
                    old.and_then(|s| s.intended_url)
                }
                None => None,
            };
            let session = start_session(tx, Some(&user), None)?;
            AuditRecorder::record(
                tx,
                &NewAuditEntry::new(actions::LOGIN, format!("{} logged in", user.email))
                    .actor(&user.id)
                    .subject(user.email.as_str())
                    .context(ctx),
            )?;
            Ok::<_, EngineError>(LoginOutcome {
                session,
                user: AuthenticatedUser::from(user.clone()),
                redirect_to: intended.filter(|u| is_local_path(u)).unwrap_or_else(|| DEFAULT_REDIRECT.to_string()),
            })
        })?;
        info!(user_id = %outcome.user.id, "login succeeded");
        Ok(outcome)
    }

    fn fail_login(&self, email: &str, ctx: &RequestContext) -> EngineError {
        let entry = NewAuditEntry::new(actions::LOGIN_FAILED, format!("Failed login attempt for {email}"))
            .subject(email)
            .context(ctx);
        if let Err(e) = self.db.with_conn(|conn| AuditRecorder::record(conn, &entry)) {
            warn!(error = %e, "failed login not audited");
        }
        warn!("login failed");
        EngineError::InvalidCredentials
    }

    /// Destroy the session and issue a fresh anonymous one. Anonymous
    /// logouts are not audited.
    #[instrument(skip_all)]
    pub fn logout(&self, token: Option<&str>, ctx: &RequestContext) -> Result<SessionHandle, EngineError> {
        self.db.with_tx(|tx| {
            if let Some(token) = token {
                let hash = token_hash(token);
                if let Some(old) = WebSessionRepo::get(tx, &hash)? {
                    WebSessionRepo::delete(tx, &hash)?;
                    if let Some(user_id) = old.user_id {
                        AuditRecorder::record(
                            tx,
                            &NewAuditEntry::new(actions::LOGOUT, "Logged out").actor(&user_id).context(ctx),
                        )?;
                        info!(user_id = %user_id, "logout");
                    }
                }
            }
            start_session(tx, None, None)
        })
    }

    /// Create an account. The password is hashed before the row is written.
    #[instrument(skip_all, fields(email = %normalize_email(email), is_admin = is_admin))]
    pub fn register(&self, email: &str, name: &str, password: &Password, is_admin: bool) -> Result<AuthenticatedUser, EngineError> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::validation("email", "The email field must be a valid email address."));
        }
        if name.trim().is_empty() {
            return Err(EngineError::validation("name", "The name field is required."));
        }
        if password.expose().chars().count() < 8 {
            return Err(EngineError::validation("password", "The password field must be at least 8 characters."));
        }
        let hash = hash_password(password, self.params.clone())?;
        let row = self
            .db
            .with_conn(|conn| UserRepo::create(conn, &email, name.trim(), &hash, is_admin))?;
        info!(user_id = %row.id, is_admin, "user registered");
        Ok(row.into())
    }

    fn idle_cutoff(&self) -> DateTime<Utc> {
        Utc::now().checked_sub_signed(self.ttl).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn start_session(conn: &Connection, user: Option<&UserRow>, intended: Option<&str>) -> Result<SessionHandle, EngineError> {
    let token = random_token();
    let row = WebSessionRepo::create(conn, &token_hash(&token), user.map(|u| &u.id), &random_token(), intended)?;
    Ok(SessionHandle {
        token,
        state: SessionState {
            token_hash: row.token_hash,
            user: user.cloned().map(AuthenticatedUser::from),
            csrf_token: row.csrf_token,
            intended_url: row.intended_url,
        },
        issued: true,
    })
}

fn load_state(conn: &Connection, row: WebSessionRow) -> Result<SessionState, EngineError> {
    let user = match &row.user_id {
        Some(id) => UserRepo::get(conn, id)?.map(AuthenticatedUser::from),
        None => None,
    };
    Ok(SessionState {
        token_hash: row.token_hash,
        user,
        csrf_token: row.csrf_token,
        intended_url: row.intended_url,
    })
}

/// 32 random bytes, base64url without padding.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn token_hash(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// A path on this site: `/x` but not `//host` or `/\host`.
fn is_local_path(url: &str) -> bool {
    url.starts_with('/') && !url.starts_with("//") && !url.starts_with("/\\")
}

/// Compare anti-forgery tokens without short-circuiting on the first
/// differing byte.
pub fn csrf_matches(expected: &str, submitted: &str) -> bool {
    let (a, b) = (expected.as_bytes(), submitted.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passwords::{cheap_params, hash_password};
    use invoicer_store::audit::{AuditQuery, AuditRepo};

    fn gateway() -> AuthGateway {
        let db = Database::in_memory().unwrap();
        let hash = hash_password(&Password::new("secret-pass"), cheap_params()).unwrap();
        db.with_conn(|conn| UserRepo::create(conn, "ana@example.com", "Ana", &hash, false))
            .unwrap();
        AuthGateway::new(db, Duration::hours(1)).with_hash_params(cheap_params())
    }

    fn audit(gw: &AuthGateway, action: &str) -> Vec<invoicer_store::audit::AuditRow> {
        gw.db
            .with_conn(|conn| {
                AuditRepo::list(
                    conn,
                    &AuditQuery {
                        action: Some(action.into()),
                        ..Default::default()
                    },
                )
            })
            .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext {
            ip: Some("10.0.0.7".into()),
            user_agent: Some("test-agent".into()),
        }
    }

    #[test]
    fn resolve_creates_then_reuses_anonymous_session() {
        let gw = gateway();
        let first = gw.resolve(None).unwrap();
        assert!(first.issued);
        assert!(!first.state.is_authenticated());
        assert!(!first.state.csrf_token.is_empty());

        let again = gw.resolve(Some(&first.token)).unwrap();
        assert!(!again.issued);
        assert_eq!(again.state.csrf_token, first.state.csrf_token);

        let unknown = gw.resolve(Some("forged")).unwrap();
        assert!(unknown.issued);
        assert_ne!(unknown.token, "forged");
    }

    #[test]
    fn successful_login_rotates_session_and_audits_once() {
        let gw = gateway();
        let anon = gw.resolve(None).unwrap();
        let out = gw
            .login(Some(&anon.token), &Credentials::new(" ANA@example.com", "secret-pass"), &ctx())
            .unwrap();

        assert_ne!(out.session.token, anon.token);
        assert_ne!(out.session.state.csrf_token, anon.state.csrf_token);
        assert_eq!(out.redirect_to, DEFAULT_REDIRECT);
        assert_eq!(out.user.email, "ana@example.com");

        // the pre-login token is gone
        assert!(gw.resolve(Some(&anon.token)).unwrap().issued);
        let resumed = gw.resolve(Some(&out.session.token)).unwrap();
        assert_eq!(resumed.state.user.as_ref().map(|u| u.id.clone()), Some(out.user.id.clone()));

        let rows = audit(&gw, actions::LOGIN);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actor_id, Some(out.user.id));
        assert_eq!(rows[0].ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn failed_login_is_indistinguishable_and_audited() {
        let gw = gateway();
        let anon = gw.resolve(None).unwrap();

        let wrong = gw.login(Some(&anon.token), &Credentials::new("ana@example.com", "nope"), &ctx());
        let unknown = gw.login(Some(&anon.token), &Credentials::new("bob@example.com", "nope"), &ctx());
        assert!(matches!(wrong, Err(EngineError::InvalidCredentials)));
        assert!(matches!(unknown, Err(EngineError::InvalidCredentials)));

        let still = gw.resolve(Some(&anon.token)).unwrap();
        assert!(!still.issued);
        assert!(!still.state.is_authenticated());

        let rows = audit(&gw, actions::LOGIN_FAILED);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.actor_id.is_none()));
        assert!(rows.iter().any(|r| r.subject.as_deref() == Some("bob@example.com")));
        assert!(audit(&gw, actions::LOGIN).is_empty());
    }

    #[test]
    fn login_returns_to_intended_url() {
        let gw = gateway();
        let anon = gw.resolve(None).unwrap();
        gw.remember_intended(&anon.state, "/invoices/inv_1").unwrap();
        let out = gw
            .login(Some(&anon.token), &Credentials::new("ana@example.com", "secret-pass"), &ctx())
            .unwrap();
        assert_eq!(out.redirect_to, "/invoices/inv_1");
    }

    #[test]
    fn offsite_intended_url_is_ignored() {
        let gw = gateway();
        let anon = gw.resolve(None).unwrap();
        gw.remember_intended(&anon.state, "//evil.example/").unwrap();
        let out = gw
            .login(Some(&anon.token), &Credentials::new("ana@example.com", "secret-pass"), &ctx())
            .unwrap();
        assert_eq!(out.redirect_to, DEFAULT_REDIRECT);
    }

    #[test]
    fn logout_issues_fresh_anonymous_session() {
        let gw = gateway();
        let out = gw
            .login(None, &Credentials::new("ana@example.com", "secret-pass"), &ctx())
            .unwrap();
        let fresh = gw.logout(Some(&out.session.token), &ctx()).unwrap();
        assert!(!fresh.state.is_authenticated());
        assert_ne!(fresh.state.csrf_token, out.session.state.csrf_token);
        assert!(gw.resolve(Some(&out.session.token)).unwrap().issued);

        let rows = audit(&gw, actions::LOGOUT);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actor_id, Some(out.user.id));
    }

    #[test]
    fn register_rejects_duplicates_and_short_passwords() {
        let gw = gateway();
        let short = gw.register("new@example.com", "New", &Password::new("short"), false);
        assert!(matches!(short, Err(EngineError::Validation { field, .. }) if field == "password"));
        let dup = gw.register("Ana@Example.com", "Ana", &Password::new("long-enough"), false);
        assert!(matches!(dup, Err(EngineError::Store(invoicer_store::StoreError::Conflict(_)))));
    }

    #[test]
    fn idle_sessions_expire() {
        let db = Database::in_memory().unwrap();
        let gw = AuthGateway::new(db, Duration::seconds(-1));
        let anon = gw.resolve(None).unwrap();
        assert!(gw.resolve(Some(&anon.token)).unwrap().issued);
    }

    #[test]
    fn huge_ttl_keeps_sessions_alive() {
        let gw = AuthGateway::new(Database::in_memory().unwrap(), Duration::MAX);
        let anon = gw.resolve(None).unwrap();
        assert!(!gw.resolve(Some(&anon.token)).unwrap().issued);
    }

    #[test]
    fn csrf_comparison() {
        assert!(csrf_matches("abc", "abc"));
        assert!(!csrf_matches("abc", "abd"));
        assert!(!csrf_matches("abc", "ab"));
    }
}
