use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::ids::{EventId, NotificationId, UserId};

use crate::error::StoreError;
use crate::row_helpers::{fmt_ts, get, now_ts, parse_json, parse_opt_ts, parse_ts};

#[derive(Clone, Debug, Serialize)]
pub struct NotificationRow {
    pub id: NotificationId,
    pub event_id: EventId,
    pub recipient_id: UserId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewNotification {
    /// Idempotency key; one notification per logical event.
    pub event_id: EventId,
    pub recipient_id: UserId,
    pub kind: String,
    pub payload: serde_json::Value,
}

const COLUMNS: &str = "id, event_id, recipient_id, kind, payload, read_at, created_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<NotificationRow, StoreError> {
    const TABLE: &str = "notifications";
    Ok(NotificationRow {
        id: NotificationId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        event_id: EventId::from_raw(get::<String>(row, 1, TABLE, "event_id")?),
        recipient_id: UserId::from_raw(get::<String>(row, 2, TABLE, "recipient_id")?),
        kind: get(row, 3, TABLE, "kind")?,
        payload: parse_json(&get::<String>(row, 4, TABLE, "payload")?, TABLE, "payload")?,
        read_at: parse_opt_ts(get(row, 5, TABLE, "read_at")?, TABLE, "read_at")?,
        created_at: parse_ts(&get::<String>(row, 6, TABLE, "created_at")?, TABLE, "created_at")?,
    })
}

pub struct NotificationRepo;

impl NotificationRepo {
    /// Returns `false` when a notification for this event already exists.
    #[instrument(skip(conn, n), fields(kind = %n.kind, event_id = %n.event_id))]
    pub fn insert(conn: &Connection, n: &NewNotification) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(&n.payload)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO notifications (id, event_id, recipient_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                NotificationId::new().as_str(),
                n.event_id.as_str(),
                n.recipient_id.as_str(),
                n.kind,
                payload,
                now_ts()
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get(conn: &Connection, id: &NotificationId) -> Result<Option<NotificationRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let found = rows.next()?.map(from_row).transpose()?;
        Ok(found)
    }

    /// Newest first.
    pub fn list_for(conn: &Connection, recipient: &UserId, unread_only: bool) -> Result<Vec<NotificationRow>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM notifications
             WHERE recipient_id = ?1 AND (?2 = 0 OR read_at IS NULL)
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![recipient.as_str(), unread_only])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    }

    pub fn count_unread(conn: &Connection, recipient: &UserId) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND read_at IS NULL",
            [recipient.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Mark read at `at`. Already-read notifications keep their first read time.
    pub fn mark_read(conn: &Connection, id: &NotificationId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE notifications SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
            params![fmt_ts(at), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Delete notifications read strictly before `cutoff`. Unread rows are
    /// never touched.
    #[instrument(skip(conn), fields(cutoff = %cutoff))]
    pub fn delete_read_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(conn.execute(
            "DELETE FROM notifications WHERE read_at IS NOT NULL AND read_at < ?1",
            [fmt_ts(cutoff)],
        )?)
    }
}
