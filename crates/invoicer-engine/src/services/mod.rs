//! Entity services: every user-facing mutation goes through here.
//!
//! A mutation runs as one transaction: primary write, mandatory totals
//! recalculation, then observer dispatch for each emitted event.

mod customers;
mod dashboard;
mod invoices;
mod items;
mod notifications;
mod quotes;

pub use customers::{CustomerInput, CustomerService};
pub use dashboard::{Dashboard, DashboardService};
pub use invoices::{InvoiceInput, InvoiceService};
pub use items::{ItemInput, ItemService};
pub use notifications::NotificationService;
pub use quotes::{QuoteInput, QuoteService};

use std::sync::{Arc, OnceLock};

use regex::Regex;
use rusqlite::Connection;
use tracing::debug;

use invoicer_core::events::EntityEvent;
use invoicer_core::ids::{CustomerId, UserId};
use invoicer_core::policy::{authorize, Ability, Actor};
use invoicer_core::{LineItem, Money};
use invoicer_store::customers::CustomerRepo;
use invoicer_store::Database;

use crate::error::EngineError;
use crate::observers::ObserverRegistry;
use crate::totals::TotalsRecalculator;

const MAX_NAME_LEN: usize = 200;
const MAX_LINES: usize = 500;

/// Shared handles every service needs.
#[derive(Clone)]
pub struct ServiceContext {
    pub db: Database,
    pub observers: Arc<ObserverRegistry>,
    pub totals: TotalsRecalculator,
}

impl ServiceContext {
    pub fn new(db: Database, observers: Arc<ObserverRegistry>, totals: TotalsRecalculator) -> Self {
        Self { db, observers, totals }
    }

    /// Run `write` in a transaction, then dispatch the events it returns.
    /// Observer failures never fail the mutation; any error from `write`
    /// rolls everything back.
    pub(crate) fn mutate<T>(
        &self,
        write: impl FnOnce(&Connection) -> Result<(T, Vec<EntityEvent>), EngineError>,
    ) -> Result<T, EngineError> {
        self.db.with_tx(|tx| {
            let (out, events) = write(tx)?;
            for event in &events {
                let report = self.observers.dispatch(tx, event);
                debug!(
                    action = %event.action(),
                    entity_id = %event.entity_id,
                    delivered = report.delivered.len(),
                    failed = report.failed.len(),
                    "observers dispatched"
                );
            }
            Ok(out)
        })
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T, EngineError>) -> Result<T, EngineError> {
        self.db.with_conn(f)
    }
}

/// Rows visible to `actor` in list views: admins see every tenant.
fn list_scope(actor: &Actor) -> Option<&UserId> {
    (!actor.is_admin).then_some(&actor.user_id)
}

/// Fetch a row and check `ability` against its owner. Missing rows are
/// `NotFound` regardless of owner.
fn owned<T>(
    found: Option<T>,
    what: impl std::fmt::Display,
    owner: impl FnOnce(&T) -> &UserId,
    actor: &Actor,
    ability: Ability,
) -> Result<T, EngineError> {
    let row = found.ok_or_else(|| EngineError::not_found(what))?;
    authorize(actor, owner(&row), ability)?;
    Ok(row)
}

fn required_name(field: &str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(field, format!("The {field} field is required.")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::validation(
            field,
            format!("The {field} field must not be greater than {MAX_NAME_LEN} characters."),
        ));
    }
    Ok(trimmed.to_string())
}

fn optional_email(field: &str, value: Option<&str>) -> Result<Option<String>, EngineError> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let valid = EMAIL
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(raw));
    if !valid {
        return Err(EngineError::validation(
            field,
            format!("The {field} field must be a valid email address."),
        ));
    }
    Ok(Some(raw.to_lowercase()))
}

fn non_negative(field: &str, amount: Money) -> Result<Money, EngineError> {
    if amount.is_negative() {
        return Err(EngineError::validation(field, format!("The {field} must be at least 0.")));
    }
    Ok(amount)
}

fn validate_lines(lines: &[LineItem]) -> Result<Vec<LineItem>, EngineError> {
    if lines.len() > MAX_LINES {
        return Err(EngineError::validation(
            "lines",
            format!("A document may not have more than {MAX_LINES} lines."),
        ));
    }
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let field = format!("lines.{i}");
            if line.quantity == 0 {
                return Err(EngineError::validation(format!("{field}.quantity"), "The quantity must be at least 1."));
            }
            non_negative(&format!("{field}.unit_price"), line.unit_price)?;
            Ok(LineItem {
                item_id: line.item_id.clone(),
                description: required_name(&format!("{field}.description"), &line.description)?,
                unit_price: line.unit_price,
                quantity: line.quantity,
            })
        })
        .collect()
}

/// The customer on a document must exist and belong to the document owner.
fn check_customer(conn: &Connection, owner: &UserId, customer: &CustomerId) -> Result<(), EngineError> {
    match CustomerRepo::get(conn, customer)? {
        Some(c) if &c.owner_id == owner => Ok(()),
        _ => Err(EngineError::validation("customer_id", "The selected customer is invalid.")),
    }
}
