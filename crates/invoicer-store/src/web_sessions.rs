//! Server-side browser sessions, keyed by the SHA-256 of the cookie token.
//! The raw token never reaches the database.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use invoicer_core::ids::UserId;

use crate::error::StoreError;
use crate::row_helpers::{fmt_ts, get, now_ts, parse_ts};

#[derive(Clone, Debug)]
pub struct WebSessionRow {
    pub token_hash: String,
    /// `None` while anonymous.
    pub user_id: Option<UserId>,
    pub csrf_token: String,
    /// Where to send the visitor after login.
    pub intended_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

fn from_row(row: &rusqlite::Row<'_>) -> Result<WebSessionRow, StoreError> {
    const TABLE: &str = "web_sessions";
    Ok(WebSessionRow {
        token_hash: get(row, 0, TABLE, "token_hash")?,
        user_id: get::<Option<String>>(row, 1, TABLE, "user_id")?.map(UserId::from_raw),
        csrf_token: get(row, 2, TABLE, "csrf_token")?,
        intended_url: get(row, 3, TABLE, "intended_url")?,
        created_at: parse_ts(&get::<String>(row, 4, TABLE, "created_at")?, TABLE, "created_at")?,
        last_seen_at: parse_ts(&get::<String>(row, 5, TABLE, "last_seen_at")?, TABLE, "last_seen_at")?,
    })
}

pub struct WebSessionRepo;

impl WebSessionRepo {
    #[instrument(skip_all, fields(authenticated = user.is_some()))]
    pub fn create(
        conn: &Connection,
        token_hash: &str,
        user: Option<&UserId>,
        csrf_token: &str,
        intended_url: Option<&str>,
    ) -> Result<WebSessionRow, StoreError> {
        let now = now_ts();
        conn.execute(
            "INSERT INTO web_sessions (token_hash, user_id, csrf_token, intended_url, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![token_hash, user.map(UserId::as_str), csrf_token, intended_url, now],
        )?;
        Self::get(conn, token_hash)?.ok_or_else(|| StoreError::NotFound("web session".into()))
    }

    pub fn get(conn: &Connection, token_hash: &str) -> Result<Option<WebSessionRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT token_hash, user_id, csrf_token, intended_url, created_at, last_seen_at
             FROM web_sessions WHERE token_hash = ?1",
        )?;
        let mut rows = stmt.query([token_hash])?;
        let found = rows.next()?.map(from_row).transpose()?;
        Ok(found)
    }

    pub fn touch(conn: &Connection, token_hash: &str) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE web_sessions SET last_seen_at = ?1 WHERE token_hash = ?2",
            params![now_ts(), token_hash],
        )?;
        Ok(changed > 0)
    }

    pub fn set_intended_url(conn: &Connection, token_hash: &str, url: Option<&str>) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE web_sessions SET intended_url = ?1 WHERE token_hash = ?2",
            params![url, token_hash],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(conn: &Connection, token_hash: &str) -> Result<bool, StoreError> {
        let changed = conn.execute("DELETE FROM web_sessions WHERE token_hash = ?1", [token_hash])?;
        Ok(changed > 0)
    }

    /// Drop sessions not seen since `before`.
    #[instrument(skip(conn), fields(before = %before))]
    pub fn delete_idle(conn: &Connection, before: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(conn.execute("DELETE FROM web_sessions WHERE last_seen_at < ?1", [fmt_ts(before)])?)
    }
}
