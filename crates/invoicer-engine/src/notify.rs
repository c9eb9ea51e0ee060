use rusqlite::Connection;
use serde_json::json;

use invoicer_core::events::{EntityEvent, EntityKind};
use invoicer_core::status::{InvoiceStatus, QuoteStatus};
use invoicer_store::notifications::{NewNotification, NotificationRepo};

use crate::observers::{Observer, ObserverError};

/// Tells a document's owner when a quote is accepted or rejected, and when
/// an invoice is paid or goes overdue.
pub struct NotificationObserver;

impl NotificationObserver {
    fn kind_for(event: &EntityEvent) -> Option<&'static str> {
        match event.kind {
            EntityKind::Quote if event.entered_status(QuoteStatus::Accepted.as_str()) => Some("quote.accepted"),
            EntityKind::Quote if event.entered_status(QuoteStatus::Rejected.as_str()) => Some("quote.rejected"),
            EntityKind::Invoice if event.entered_status(InvoiceStatus::Paid.as_str()) => Some("invoice.paid"),
            EntityKind::Invoice if event.entered_status(InvoiceStatus::Overdue.as_str()) => Some("invoice.overdue"),
            _ => None,
        }
    }
}

impl Observer for NotificationObserver {
    fn name(&self) -> &str {
        "notifications"
    }

    fn handles(&self, kind: EntityKind) -> bool {
        kind.has_line_items()
    }

    fn on_event(&self, conn: &Connection, event: &EntityEvent) -> Result<(), ObserverError> {
        let Some(kind) = Self::kind_for(event) else {
            return Ok(());
        };
        NotificationRepo::insert(
            conn,
            &NewNotification {
                event_id: event.id.clone(),
                recipient_id: event.owner_id.clone(),
                kind: kind.to_string(),
                payload: json!({
                    "entity_id": event.entity_id,
                    "number": event.label,
                    "status": event.status_change.as_ref().map(|c| c.to.clone()),
                    "actor_id": event.actor_id,
                }),
            },
        )?;
        Ok(())
    }
}
