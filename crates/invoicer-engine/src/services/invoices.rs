use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{info, instrument};

use invoicer_core::events::{ChangeKind, EntityEvent, EntityKind};
use invoicer_core::ids::{CustomerId, InvoiceId};
use invoicer_core::policy::{Ability, Actor};
use invoicer_core::status::{InvoiceStatus, TransitionError};
use invoicer_core::{LineItem, Money};
use invoicer_store::invoices::{InvoiceFields, InvoiceRepo, InvoiceRow};

use super::{check_customer, list_scope, non_negative, owned, validate_lines, ServiceContext};
use crate::error::EngineError;

#[derive(Clone, Debug, Deserialize)]
pub struct InvoiceInput {
    pub customer_id: CustomerId,
    #[serde(default)]
    pub discount: Money,
    #[serde(default)]
    pub due_on: Option<NaiveDate>,
    #[serde(default)]
    pub lines: Option<Vec<LineItem>>,
}

impl InvoiceInput {
    fn fields(&self) -> Result<InvoiceFields, EngineError> {
        Ok(InvoiceFields {
            customer_id: self.customer_id.clone(),
            discount: non_negative("discount", self.discount)?,
            due_on: self.due_on,
        })
    }
}

#[derive(Clone)]
pub struct InvoiceService {
    ctx: ServiceContext,
}

impl InvoiceService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn load(conn: &Connection, actor: &Actor, id: &InvoiceId, ability: Ability) -> Result<InvoiceRow, EngineError> {
        owned(InvoiceRepo::get(conn, id)?, format!("invoice {id}"), |i| &i.owner_id, actor, ability)
    }

    fn fetch(conn: &Connection, id: &InvoiceId) -> Result<InvoiceRow, EngineError> {
        InvoiceRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("invoice {id}")))
    }

    fn ensure_editable(invoice: &InvoiceRow) -> Result<(), EngineError> {
        if invoice.status.is_editable() {
            return Ok(());
        }
        Err(EngineError::Locked {
            what: format!("invoice {}", invoice.number),
            status: invoice.status.to_string(),
        })
    }

    fn event(invoice: &InvoiceRow, change: ChangeKind, actor: &Actor) -> EntityEvent {
        EntityEvent::new(EntityKind::Invoice, change, invoice.id.as_str(), invoice.owner_id.clone(), &invoice.number)
            .by(&actor.user_id)
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id))]
    pub fn create(&self, actor: &Actor, input: &InvoiceInput) -> Result<InvoiceRow, EngineError> {
        let fields = input.fields()?;
        let lines = validate_lines(input.lines.as_deref().unwrap_or_default())?;
        let invoice = self.ctx.mutate(|conn| {
            check_customer(conn, &actor.user_id, &fields.customer_id)?;
            let created = InvoiceRepo::create(conn, &actor.user_id, &fields, &lines, None)?;
            self.ctx.totals.recalc_invoice(conn, &created.id)?;
            let invoice = Self::fetch(conn, &created.id)?;
            let event = Self::event(&invoice, ChangeKind::Created, actor).with_lines_changed();
            Ok((invoice, vec![event]))
        })?;
        info!(invoice_id = %invoice.id, number = %invoice.number, "invoice created");
        Ok(invoice)
    }

    pub fn get(&self, actor: &Actor, id: &InvoiceId) -> Result<InvoiceRow, EngineError> {
        self.ctx.read(|conn| Self::load(conn, actor, id, Ability::View))
    }

    pub fn list(&self, actor: &Actor) -> Result<Vec<InvoiceRow>, EngineError> {
        self.ctx.read(|conn| Ok(InvoiceRepo::list(conn, list_scope(actor))?))
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id, invoice_id = %id))]
    pub fn update(&self, actor: &Actor, id: &InvoiceId, input: &InvoiceInput) -> Result<InvoiceRow, EngineError> {
        let fields = input.fields()?;
        let lines = input.lines.as_deref().map(validate_lines).transpose()?;
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            Self::ensure_editable(&existing)?;
            check_customer(conn, &existing.owner_id, &fields.customer_id)?;
            InvoiceRepo::update(conn, id, &fields)?;
            if let Some(lines) = &lines {
                InvoiceRepo::replace_lines(conn, id, lines)?;
            }
            self.ctx.totals.recalc_invoice(conn, id)?;
            let invoice = Self::fetch(conn, id)?;
            let mut event = Self::event(&invoice, ChangeKind::Updated, actor);
            if lines.is_some() {
                event = event.with_lines_changed();
            }
            Ok((invoice, vec![event]))
        })
    }

    #[instrument(skip(self, lines), fields(actor_id = %actor.user_id, invoice_id = %id, lines = lines.len()))]
    pub fn replace_lines(&self, actor: &Actor, id: &InvoiceId, lines: &[LineItem]) -> Result<InvoiceRow, EngineError> {
        let lines = validate_lines(lines)?;
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            Self::ensure_editable(&existing)?;
            InvoiceRepo::replace_lines(conn, id, &lines)?;
            self.ctx.totals.recalc_invoice(conn, id)?;
            let invoice = Self::fetch(conn, id)?;
            let event = Self::event(&invoice, ChangeKind::Updated, actor).with_lines_changed();
            Ok((invoice, vec![event]))
        })
    }

    #[instrument(skip(self), fields(actor_id = %actor.user_id, invoice_id = %id, to = %to))]
    pub fn transition(&self, actor: &Actor, id: &InvoiceId, to: InvoiceStatus) -> Result<InvoiceRow, EngineError> {
        let invoice = self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            let from = existing.status;
            if !from.can_transition_to(to) {
                return Err(TransitionError {
                    entity: "invoice",
                    from: from.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            InvoiceRepo::set_status(conn, id, to)?;
            let invoice = Self::fetch(conn, id)?;
            let event = Self::event(&invoice, ChangeKind::Updated, actor).with_status_change(from, to);
            Ok((invoice, vec![event]))
        })?;
        info!(number = %invoice.number, status = %invoice.status, "invoice status changed");
        Ok(invoice)
    }

    /// Only drafts and cancelled invoices may be deleted.
    #[instrument(skip(self), fields(actor_id = %actor.user_id, invoice_id = %id))]
    pub fn delete(&self, actor: &Actor, id: &InvoiceId) -> Result<(), EngineError> {
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Delete)?;
            if !matches!(existing.status, InvoiceStatus::Draft | InvoiceStatus::Cancelled) {
                return Err(EngineError::Locked {
                    what: format!("invoice {}", existing.number),
                    status: existing.status.to_string(),
                });
            }
            InvoiceRepo::delete(conn, id)?;
            Ok(((), vec![Self::event(&existing, ChangeKind::Deleted, actor)]))
        })
    }
}
