//! Audit recording: explicit entries (authentication) and the observer
//! that turns entity events into audit rows.

use rusqlite::Connection;
use tracing::debug;

use invoicer_core::audit::NewAuditEntry;
use invoicer_core::events::EntityEvent;
use invoicer_core::policy::Actor;
use invoicer_store::audit::{AuditQuery, AuditRepo, AuditRow};
use invoicer_store::Database;

use crate::error::EngineError;
use crate::observers::{Observer, ObserverError};

/// Writes audit rows. Insertion is idempotent on the entry's event id.
pub struct AuditRecorder;

impl AuditRecorder {
    pub fn record(conn: &Connection, entry: &NewAuditEntry) -> Result<bool, EngineError> {
        let inserted = AuditRepo::insert(conn, entry)?;
        if inserted {
            debug!(action = %entry.action, event_id = %entry.event_id, "audit entry recorded");
        } else {
            debug!(action = %entry.action, event_id = %entry.event_id, "audit entry already recorded");
        }
        Ok(inserted)
    }
}

/// One audit row per customer, item, quote and invoice mutation.
pub struct AuditObserver;

impl Observer for AuditObserver {
    fn name(&self) -> &str {
        "audit"
    }

    fn on_event(&self, conn: &Connection, event: &EntityEvent) -> Result<(), ObserverError> {
        AuditRepo::insert(conn, &NewAuditEntry::for_event(event))?;
        Ok(())
    }
}

/// Read access to the audit log. Admins see everything, everyone else only
/// the entries they performed.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list(&self, actor: &Actor, action: Option<String>, limit: Option<u32>) -> Result<Vec<AuditRow>, EngineError> {
        let query = AuditQuery {
            actor_id: (!actor.is_admin).then(|| actor.user_id.clone()),
            action,
            subject: None,
            limit: Some(limit.unwrap_or(100).min(1000)),
        };
        self.db.with_conn(|conn| Ok(AuditRepo::list(conn, &query)?))
    }
}
