//! User accounts. Email uniqueness is case-insensitive (`COLLATE NOCASE`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use invoicer_core::ids::UserId;

use crate::error::StoreError;
use crate::row_helpers::{get, now_ts, parse_ts};

#[derive(Clone, Debug)]
pub struct UserRow {
    pub id: UserId,
    pub email: String,
    pub name: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, email, name, password_hash, is_admin, created_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::from_raw(get::<String>(row, 0, "users", "id")?),
        email: get(row, 1, "users", "email")?,
        name: get(row, 2, "users", "name")?,
        password_hash: get(row, 3, "users", "password_hash")?,
        is_admin: get(row, 4, "users", "is_admin")?,
        created_at: parse_ts(&get::<String>(row, 5, "users", "created_at")?, "users", "created_at")?,
    })
}

pub struct UserRepo;

impl UserRepo {
    /// Create a user. A duplicate email yields `StoreError::Conflict`.
    #[instrument(skip(conn, password_hash), fields(email))]
    pub fn create(
        conn: &Connection,
        email: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<UserRow, StoreError> {
        let id = UserId::new();
        let now = now_ts();
        conn.execute(
            "INSERT INTO users (id, email, name, password_hash, is_admin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id.as_str(), email, name, password_hash, is_admin, now],
        )
        .map_err(|e| match StoreError::from(e) {
            StoreError::Conflict(_) => StoreError::Conflict(format!("email already registered: {email}")),
            other => other,
        })?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    pub fn get(conn: &Connection, id: &UserId) -> Result<Option<UserRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM users WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let user = rows.next()?.map(from_row).transpose()?;
        Ok(user)
    }

    /// Look up by email, case-insensitively.
    pub fn get_by_email(conn: &Connection, email: &str) -> Result<Option<UserRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM users WHERE email = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([email])?;
        let user = rows.next()?.map(from_row).transpose()?;
        Ok(user)
    }

    pub fn exists(conn: &Connection, id: &UserId) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }
}
