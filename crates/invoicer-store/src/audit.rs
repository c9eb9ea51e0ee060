//! Append-only audit log. Rows are inserted once per event id and only
//! ever removed in bulk by the retention sweep.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::audit::NewAuditEntry;
use invoicer_core::ids::{EventId, UserId};

use crate::error::StoreError;
use crate::row_helpers::{fmt_ts, get, parse_ts};

#[derive(Clone, Debug, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub event_id: EventId,
    pub actor_id: Option<UserId>,
    pub action: String,
    pub subject: Option<String>,
    pub description: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub performed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub actor_id: Option<UserId>,
    pub action: Option<String>,
    pub subject: Option<String>,
    pub limit: Option<u32>,
}

fn from_row(row: &rusqlite::Row<'_>) -> Result<AuditRow, StoreError> {
    const TABLE: &str = "audit_log";
    Ok(AuditRow {
        id: get(row, 0, TABLE, "id")?,
        event_id: EventId::from_raw(get::<String>(row, 1, TABLE, "event_id")?),
        actor_id: get::<Option<String>>(row, 2, TABLE, "actor_id")?.map(UserId::from_raw),
        action: get(row, 3, TABLE, "action")?,
        subject: get(row, 4, TABLE, "subject")?,
        description: get(row, 5, TABLE, "description")?,
        ip: get(row, 6, TABLE, "ip")?,
        user_agent: get(row, 7, TABLE, "user_agent")?,
        performed_at: parse_ts(&get::<String>(row, 8, TABLE, "performed_at")?, TABLE, "performed_at")?,
    })
}

pub struct AuditRepo;

impl AuditRepo {
    /// Insert an entry stamped now. Returns `false` when the event id was
    /// already recorded.
    pub fn insert(conn: &Connection, entry: &NewAuditEntry) -> Result<bool, StoreError> {
        Self::insert_at(conn, entry, Utc::now())
    }

    #[instrument(skip(conn, entry), fields(action = %entry.action, event_id = %entry.event_id))]
    pub fn insert_at(
        conn: &Connection,
        entry: &NewAuditEntry,
        performed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO audit_log
                 (event_id, actor_id, action, subject, description, ip, user_agent, performed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.event_id.as_str(),
                entry.actor_id.as_ref().map(UserId::as_str),
                entry.action,
                entry.subject,
                entry.description,
                entry.context.ip,
                entry.context.user_agent,
                fmt_ts(performed_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Newest first, default limit 100.
    pub fn list(conn: &Connection, q: &AuditQuery) -> Result<Vec<AuditRow>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, event_id, actor_id, action, subject, description, ip, user_agent, performed_at
             FROM audit_log
             WHERE (?1 IS NULL OR actor_id = ?1)
               AND (?2 IS NULL OR action = ?2)
               AND (?3 IS NULL OR subject = ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let mut rows = stmt.query(params![
            q.actor_id.as_ref().map(UserId::as_str),
            q.action,
            q.subject,
            q.limit.unwrap_or(100),
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
    }

    /// Delete every entry performed strictly before `cutoff`.
    #[instrument(skip(conn), fields(cutoff = %cutoff))]
    pub fn delete_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(conn.execute("DELETE FROM audit_log WHERE performed_at < ?1", [fmt_ts(cutoff)])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Duration;
    use invoicer_core::audit::{actions, RequestContext};

    #[test]
    fn insert_is_idempotent_on_event_id() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let entry = NewAuditEntry::new(actions::LOGIN_FAILED, "Failed login").subject("ana@example.com");
            assert!(AuditRepo::insert(conn, &entry)?);
            assert!(!AuditRepo::insert(conn, &entry)?);
            assert_eq!(AuditRepo::count(conn)?, 1);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn list_filters_and_keeps_context() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let actor = UserId::from_raw("usr_1");
            let ctx = RequestContext {
                ip: Some("10.0.0.9".into()),
                user_agent: Some("curl/8".into()),
            };
            AuditRepo::insert(conn, &NewAuditEntry::new(actions::LOGIN, "Logged in").actor(&actor).context(&ctx))?;
            AuditRepo::insert(conn, &NewAuditEntry::new(actions::LOGOUT, "Logged out").actor(&actor))?;
            AuditRepo::insert(conn, &NewAuditEntry::new(actions::LOGIN_FAILED, "Failed").subject("x@y.z"))?;

            let mine = AuditRepo::list(
                conn,
                &AuditQuery {
                    actor_id: Some(actor.clone()),
                    ..Default::default()
                },
            )?;
            assert_eq!(mine.len(), 2);
            assert_eq!(mine[0].action, actions::LOGOUT);

            let logins = AuditRepo::list(
                conn,
                &AuditQuery {
                    action: Some(actions::LOGIN.into()),
                    ..Default::default()
                },
            )?;
            assert_eq!(logins.len(), 1);
            assert_eq!(logins[0].ip.as_deref(), Some("10.0.0.9"));
            assert_eq!(logins[0].user_agent.as_deref(), Some("curl/8"));
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn delete_before_cutoff_only() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let now = Utc::now();
            AuditRepo::insert_at(conn, &NewAuditEntry::new("a", "old"), now - Duration::days(40))?;
            AuditRepo::insert_at(conn, &NewAuditEntry::new("a", "recent"), now - Duration::days(2))?;

            let removed = AuditRepo::delete_before(conn, now - Duration::days(30))?;
            assert_eq!(removed, 1);
            let left = AuditRepo::list(conn, &AuditQuery::default())?;
            assert_eq!(left.len(), 1);
            assert_eq!(left[0].description, "recent");
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }
}
