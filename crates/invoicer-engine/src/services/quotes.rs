use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{info, instrument};

use invoicer_core::events::{ChangeKind, EntityEvent, EntityKind};
use invoicer_core::ids::{CustomerId, QuoteId};
use invoicer_core::policy::{Ability, Actor};
use invoicer_core::status::{QuoteStatus, TransitionError};
use invoicer_core::{LineItem, Money};
use invoicer_store::invoices::{InvoiceFields, InvoiceRepo, InvoiceRow};
use invoicer_store::quotes::{QuoteFields, QuoteRepo, QuoteRow};

use super::{check_customer, list_scope, non_negative, owned, validate_lines, ServiceContext};
use crate::error::EngineError;

#[derive(Clone, Debug, Deserialize)]
pub struct QuoteInput {
    pub customer_id: CustomerId,
    #[serde(default)]
    pub discount: Money,
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
    /// Replaces every line when present.
    #[serde(default)]
    pub lines: Option<Vec<LineItem>>,
}

impl QuoteInput {
    fn fields(&self) -> Result<QuoteFields, EngineError> {
        Ok(QuoteFields {
            customer_id: self.customer_id.clone(),
            discount: non_negative("discount", self.discount)?,
            valid_until: self.valid_until,
        })
    }
}

#[derive(Clone)]
pub struct QuoteService {
    ctx: ServiceContext,
}

impl QuoteService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn load(conn: &Connection, actor: &Actor, id: &QuoteId, ability: Ability) -> Result<QuoteRow, EngineError> {
        owned(QuoteRepo::get(conn, id)?, format!("quote {id}"), |q| &q.owner_id, actor, ability)
    }

    fn fetch(conn: &Connection, id: &QuoteId) -> Result<QuoteRow, EngineError> {
        QuoteRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("quote {id}")))
    }

    fn ensure_editable(quote: &QuoteRow) -> Result<(), EngineError> {
        if quote.status.is_editable() {
            Ok(())
        } else {
            Err(EngineError::Locked {
                what: format!("quote {}", quote.number),
                status: quote.status.to_string(),
            })
        }
    }

    fn event(quote: &QuoteRow, change: ChangeKind, actor: &Actor) -> EntityEvent {
        EntityEvent::new(EntityKind::Quote, change, quote.id.as_str(), quote.owner_id.clone(), &quote.number)
            .by(&actor.user_id)
    }

    #[instrument(skip(self, input), fields(actor_id = %actor.user_id))]
    pub fn create(&self, actor: &Actor, input: &QuoteInput) -> Result<QuoteRow, EngineError> {
        let fields = input.fields()?;
        let lines = validate_lines(input.lines.as_deref().unwrap_or_default())?;
        let quote = self.ctx.mutate(|conn| {
            check_customer(conn, &actor.user_id, &fields.customer_id)?;
            let created = QuoteRepo::create(conn, &actor.user_id, &fields, &lines)?;
            self.ctx.totals.recalc_quote(conn, &created.id)?;
            let quote = Self::fetch(conn, &created.id)?;
            let event = Self::event(&quote, ChangeKind::Created, actor).with_lines_changed();
            Ok((quote, vec![event]))
        })?;
        info!(quote_id = %quote.id, number = %quote.number, "quote created");
        Ok(quote)
    }

    pub fn get(&self, actor: &Actor, id: &QuoteId) -> Result<QuoteRow, EngineError> {
        self.ctx.read(|conn| Self::load(conn, actor, id, Ability::View))
    }

    pub fn list(&self, actor: &Actor) -> Result<Vec<QuoteRow>, EngineError> {
        self.ctx.read(|conn| Ok(QuoteRepo::list(conn, list_scope(actor))?))
    }

    /// Update header fields (and lines, when given) of a draft quote.
    #[instrument(skip(self, input), fields(actor_id = %actor.user_id, quote_id = %id))]
    pub fn update(&self, actor: &Actor, id: &QuoteId, input: &QuoteInput) -> Result<QuoteRow, EngineError> {
        let fields = input.fields()?;
        let lines = input.lines.as_deref().map(validate_lines).transpose()?;
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            Self::ensure_editable(&existing)?;
            check_customer(conn, &existing.owner_id, &fields.customer_id)?;
            QuoteRepo::update(conn, id, &fields)?;
            if let Some(lines) = &lines {
                QuoteRepo::replace_lines(conn, id, lines)?;
            }
            self.ctx.totals.recalc_quote(conn, id)?;
            let quote = Self::fetch(conn, id)?;
            let mut event = Self::event(&quote, ChangeKind::Updated, actor);
            if lines.is_some() {
                event = event.with_lines_changed();
            }
            Ok((quote, vec![event]))
        })
    }

    #[instrument(skip(self, lines), fields(actor_id = %actor.user_id, quote_id = %id, lines = lines.len()))]
    pub fn replace_lines(&self, actor: &Actor, id: &QuoteId, lines: &[LineItem]) -> Result<QuoteRow, EngineError> {
        let lines = validate_lines(lines)?;
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            Self::ensure_editable(&existing)?;
            QuoteRepo::replace_lines(conn, id, &lines)?;
            self.ctx.totals.recalc_quote(conn, id)?;
            let quote = Self::fetch(conn, id)?;
            let event = Self::event(&quote, ChangeKind::Updated, actor).with_lines_changed();
            Ok((quote, vec![event]))
        })
    }

    /// Move a quote along its lifecycle. Conversion has its own operation.
    #[instrument(skip(self), fields(actor_id = %actor.user_id, quote_id = %id, to = %to))]
    pub fn transition(&self, actor: &Actor, id: &QuoteId, to: QuoteStatus) -> Result<QuoteRow, EngineError> {
        if to == QuoteStatus::Converted {
            return Err(EngineError::validation("status", "Use the convert action to convert a quote."));
        }
        let quote = self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Update)?;
            let from = existing.status;
            if !from.can_transition_to(to) {
                return Err(TransitionError {
                    entity: "quote",
                    from: from.to_string(),
                    to: to.to_string(),
                }
                .into());
            }
            QuoteRepo::set_status(conn, id, to)?;
            let quote = Self::fetch(conn, id)?;
            let event = Self::event(&quote, ChangeKind::Updated, actor).with_status_change(from, to);
            Ok((quote, vec![event]))
        })?;
        info!(number = %quote.number, status = %quote.status, "quote status changed");
        Ok(quote)
    }

    /// Turn an accepted quote into a draft invoice with the same customer,
    /// lines and discount. The quote becomes `converted`.
    #[instrument(skip(self), fields(actor_id = %actor.user_id, quote_id = %id))]
    pub fn convert(&self, actor: &Actor, id: &QuoteId) -> Result<InvoiceRow, EngineError> {
        let invoice = self.ctx.mutate(|conn| {
            let quote = Self::load(conn, actor, id, Ability::Update)?;
            if !quote.status.can_transition_to(QuoteStatus::Converted) {
                return Err(TransitionError {
                    entity: "quote",
                    from: quote.status.to_string(),
                    to: QuoteStatus::Converted.to_string(),
                }
                .into());
            }

            let fields = InvoiceFields {
                customer_id: quote.customer_id.clone(),
                discount: quote.discount,
                due_on: None,
            };
            let created = InvoiceRepo::create(conn, &quote.owner_id, &fields, &quote.lines, Some(&quote.id))?;
            self.ctx.totals.recalc_invoice(conn, &created.id)?;
            QuoteRepo::set_status(conn, id, QuoteStatus::Converted)?;
            QuoteRepo::link_invoice(conn, id, &created.id)?;

            let invoice = InvoiceRepo::get(conn, &created.id)?
                .ok_or_else(|| EngineError::not_found(format!("invoice {}", created.id)))?;
            let invoice_event = EntityEvent::new(
                EntityKind::Invoice,
                ChangeKind::Created,
                invoice.id.as_str(),
                invoice.owner_id.clone(),
                &invoice.number,
            )
            .by(&actor.user_id)
            .with_lines_changed();
            let quote_event = Self::event(&quote, ChangeKind::Updated, actor)
                .with_status_change(quote.status, QuoteStatus::Converted);
            Ok((invoice, vec![invoice_event, quote_event]))
        })?;
        info!(invoice_id = %invoice.id, number = %invoice.number, "quote converted");
        Ok(invoice)
    }

    /// Converted quotes are kept as the invoice's provenance.
    #[instrument(skip(self), fields(actor_id = %actor.user_id, quote_id = %id))]
    pub fn delete(&self, actor: &Actor, id: &QuoteId) -> Result<(), EngineError> {
        self.ctx.mutate(|conn| {
            let existing = Self::load(conn, actor, id, Ability::Delete)?;
            if existing.status == QuoteStatus::Converted {
                return Err(EngineError::Locked {
                    what: format!("quote {}", existing.number),
                    status: existing.status.to_string(),
                });
            }
            QuoteRepo::delete(conn, id)?;
            Ok(((), vec![Self::event(&existing, ChangeKind::Deleted, actor)]))
        })
    }
}
