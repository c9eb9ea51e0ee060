use serde::{Deserialize, Serialize};

use crate::events::{ChangeKind, EntityEvent};
use crate::ids::{EventId, UserId};

/// Authentication actions recorded in the audit log.
pub mod actions {
    pub const LOGIN: &str = "auth.login";
    pub const LOGIN_FAILED: &str = "auth.login_failed";
    pub const LOGOUT: &str = "auth.logout";
}

/// Where a request came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// An audit row before it is written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    /// Idempotency key; a second insert with the same id is ignored.
    pub event_id: EventId,
    pub actor_id: Option<UserId>,
    pub action: String,
    pub subject: Option<String>,
    pub description: String,
    pub context: RequestContext,
}

impl NewAuditEntry {
    pub fn new(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            actor_id: None,
            action: action.into(),
            subject: None,
            description: description.into(),
            context: RequestContext::default(),
        }
    }

    pub fn actor(mut self, actor: &UserId) -> Self {
        self.actor_id = Some(actor.clone());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn context(mut self, context: &RequestContext) -> Self {
        self.context = context.clone();
        self
    }

    /// Audit row for an observed entity mutation. Reuses the event id so a
    /// replayed event maps onto the same row.
    pub fn for_event(event: &EntityEvent) -> Self {
        let mut description = format!("{} {} {}", capitalize(event.kind.as_str()), event.label, event.change.as_str());
        if let Some(change) = &event.status_change {
            description.push_str(&format!(" ({} -> {})", change.from, change.to));
        }
        if event.lines_changed && event.change == ChangeKind::Updated {
            description.push_str(", line items replaced");
        }
        Self {
            event_id: event.id.clone(),
            actor_id: event.actor_id.clone(),
            action: event.action(),
            subject: Some(event.entity_id.clone()),
            description,
            context: RequestContext::default(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
