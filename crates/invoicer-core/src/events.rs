use serde::{Deserialize, Serialize};

use crate::ids::{EventId, UserId};

/// Entity types whose mutations are observed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Item,
    Quote,
    Invoice,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Item => "item",
            Self::Quote => "quote",
            Self::Invoice => "invoice",
        }
    }

    /// Quotes and invoices carry line items and derived totals.
    pub fn has_line_items(self) -> bool {
        matches!(self, Self::Quote | Self::Invoice)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub from: String,
    pub to: String,
}

/// One logical mutation of a domain entity.
///
/// `id` identifies the logical event; replaying the same event must not
/// produce duplicate side effects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityEvent {
    pub id: EventId,
    pub kind: EntityKind,
    pub change: ChangeKind,
    pub entity_id: String,
    pub owner_id: UserId,
    pub actor_id: Option<UserId>,
    /// Human-readable label for the entity (customer name, document number).
    pub label: String,
    #[serde(default)]
    pub lines_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_change: Option<StatusChange>,
}

impl EntityEvent {
    pub fn new(
        kind: EntityKind,
        change: ChangeKind,
        entity_id: impl Into<String>,
        owner_id: UserId,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            kind,
            change,
            entity_id: entity_id.into(),
            owner_id,
            actor_id: None,
            label: label.into(),
            lines_changed: false,
            status_change: None,
        }
    }

    pub fn by(mut self, actor: &UserId) -> Self {
        self.actor_id = Some(actor.clone());
        self
    }

    pub fn with_lines_changed(mut self) -> Self {
        self.lines_changed = true;
        self
    }

    pub fn with_status_change(mut self, from: impl ToString, to: impl ToString) -> Self {
        self.status_change = Some(StatusChange {
            from: from.to_string(),
            to: to.to_string(),
        });
        self
    }

    /// Dotted action name used for audit rows, e.g. `invoice.updated`.
    pub fn action(&self) -> String {
        format!("{}.{}", self.kind.as_str(), self.change.as_str())
    }

    pub fn entered_status(&self, status: &str) -> bool {
        self.status_change.as_ref().is_some_and(|c| c.to == status)
    }
}
