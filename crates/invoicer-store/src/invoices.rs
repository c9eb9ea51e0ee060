//! Invoices and their lines. Mirrors [`crate::quotes`]; entering `paid`
//! stamps `paid_at`.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::ids::{CustomerId, InvoiceId, QuoteId, UserId};
use invoicer_core::status::InvoiceStatus;
use invoicer_core::{LineItem, Money, Totals};

use crate::error::StoreError;
use crate::lines::{self, LineTable};
use crate::row_helpers::{get, now_ts, parse_enum, parse_opt_date, parse_opt_ts, parse_ts};

#[derive(Clone, Debug, Serialize)]
pub struct InvoiceRow {
    pub id: InvoiceId,
    pub owner_id: UserId,
    pub customer_id: CustomerId,
    pub number: String,
    pub status: InvoiceStatus,
    pub discount: Money,
    pub totals: Totals,
    pub due_on: Option<NaiveDate>,
    pub paid_at: Option<DateTime<Utc>>,
    /// Quote this invoice was converted from.
    pub quote_id: Option<QuoteId>,
    pub lines: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct InvoiceFields {
    pub customer_id: CustomerId,
    pub discount: Money,
    pub due_on: Option<NaiveDate>,
}

const COLUMNS: &str = "id, owner_id, customer_id, number, status, discount, subtotal, discount_total, tax, total, \
                       due_on, paid_at, quote_id, created_at, updated_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<InvoiceRow, StoreError> {
    const TABLE: &str = "invoices";
    Ok(InvoiceRow {
        id: InvoiceId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        owner_id: UserId::from_raw(get::<String>(row, 1, TABLE, "owner_id")?),
        customer_id: CustomerId::from_raw(get::<String>(row, 2, TABLE, "customer_id")?),
        number: get(row, 3, TABLE, "number")?,
        status: parse_enum(&get::<String>(row, 4, TABLE, "status")?, TABLE, "status")?,
        discount: Money::from_cents(get(row, 5, TABLE, "discount")?),
        totals: Totals {
            subtotal: Money::from_cents(get(row, 6, TABLE, "subtotal")?),
            discount: Money::from_cents(get(row, 7, TABLE, "discount_total")?),
            tax: Money::from_cents(get(row, 8, TABLE, "tax")?),
            total: Money::from_cents(get(row, 9, TABLE, "total")?),
        },
        due_on: parse_opt_date(get(row, 10, TABLE, "due_on")?, TABLE, "due_on")?,
        paid_at: parse_opt_ts(get(row, 11, TABLE, "paid_at")?, TABLE, "paid_at")?,
        quote_id: get::<Option<String>>(row, 12, TABLE, "quote_id")?.map(QuoteId::from_raw),
        lines: Vec::new(),
        created_at: parse_ts(&get::<String>(row, 13, TABLE, "created_at")?, TABLE, "created_at")?,
        updated_at: parse_ts(&get::<String>(row, 14, TABLE, "updated_at")?, TABLE, "updated_at")?,
    })
}

pub struct InvoiceRepo;

impl InvoiceRepo {
    /// Insert a draft invoice numbered `INV-000001` onwards per owner.
    #[instrument(skip(conn, fields, lines), fields(owner_id = %owner))]
    pub fn create(
        conn: &Connection,
        owner: &UserId,
        fields: &InvoiceFields,
        lines: &[LineItem],
        quote_id: Option<&QuoteId>,
    ) -> Result<InvoiceRow, StoreError> {
        let id = InvoiceId::new();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM invoices WHERE owner_id = ?1",
            [owner.as_str()],
            |row| row.get(0),
        )?;
        let number = format!("INV-{seq:06}");
        let now = now_ts();
        conn.execute(
            "INSERT INTO invoices (id, owner_id, customer_id, seq, number, status, discount, due_on, quote_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id.as_str(),
                owner.as_str(),
                fields.customer_id.as_str(),
                seq,
                number,
                InvoiceStatus::Draft.as_str(),
                fields.discount.cents(),
                fields.due_on.map(|d| d.to_string()),
                quote_id.map(QuoteId::as_str),
                now,
            ],
        )?;
        lines::replace(conn, LineTable::Invoice, id.as_str(), lines)?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound(format!("invoice {id}")))
    }

    pub fn get(conn: &Connection, id: &InvoiceId) -> Result<Option<InvoiceRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM invoices WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let Some(mut invoice) = rows.next()?.map(from_row).transpose()? else {
            return Ok(None);
        };
        invoice.lines = lines::load(conn, LineTable::Invoice, id.as_str())?;
        Ok(Some(invoice))
    }

    /// Newest first. `owner = None` lists every tenant's invoices.
    pub fn list(conn: &Connection, owner: Option<&UserId>) -> Result<Vec<InvoiceRow>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM invoices WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([owner.map(UserId::as_str)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut invoice = from_row(row)?;
            invoice.lines = lines::load(conn, LineTable::Invoice, invoice.id.as_str())?;
            out.push(invoice);
        }
        Ok(out)
    }

    #[instrument(skip(conn, fields), fields(invoice_id = %id))]
    pub fn update(conn: &Connection, id: &InvoiceId, fields: &InvoiceFields) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE invoices SET customer_id = ?1, discount = ?2, due_on = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                fields.customer_id.as_str(),
                fields.discount.cents(),
                fields.due_on.map(|d| d.to_string()),
                now_ts(),
                id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    #[instrument(skip(conn, lines), fields(invoice_id = %id, lines = lines.len()))]
    pub fn replace_lines(conn: &Connection, id: &InvoiceId, lines: &[LineItem]) -> Result<(), StoreError> {
        lines::replace(conn, LineTable::Invoice, id.as_str(), lines)?;
        conn.execute("UPDATE invoices SET updated_at = ?1 WHERE id = ?2", params![now_ts(), id.as_str()])?;
        Ok(())
    }

    #[instrument(skip(conn), fields(invoice_id = %id, status = %status))]
    pub fn set_status(conn: &Connection, id: &InvoiceId, status: InvoiceStatus) -> Result<bool, StoreError> {
        let now = now_ts();
        let changed = conn.execute(
            "UPDATE invoices
             SET status = ?1,
                 paid_at = CASE WHEN ?1 = 'paid' THEN ?2 ELSE paid_at END,
                 updated_at = ?2
             WHERE id = ?3",
            params![status.as_str(), now, id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Quiet save of derived totals. Does not bump `updated_at`.
    pub fn store_totals(conn: &Connection, id: &InvoiceId, totals: &Totals) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE invoices SET subtotal = ?1, discount_total = ?2, tax = ?3, total = ?4 WHERE id = ?5",
            params![
                totals.subtotal.cents(),
                totals.discount.cents(),
                totals.tax.cents(),
                totals.total.cents(),
                id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    #[instrument(skip(conn), fields(invoice_id = %id))]
    pub fn delete(conn: &Connection, id: &InvoiceId) -> Result<bool, StoreError> {
        let changed = conn.execute("DELETE FROM invoices WHERE id = ?1", [id.as_str()])?;
        Ok(changed > 0)
    }

    pub fn status_counts(conn: &Connection, owner: &UserId) -> Result<Vec<(InvoiceStatus, i64)>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM invoices WHERE owner_id = ?1 GROUP BY status ORDER BY status")?;
        let mut rows = stmt.query([owner.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status = parse_enum(&get::<String>(row, 0, "invoices", "status")?, "invoices", "status")?;
            out.push((status, get(row, 1, "invoices", "count")?));
        }
        Ok(out)
    }

    /// Sum of totals of invoices still awaiting payment.
    pub fn outstanding_total(conn: &Connection, owner: &UserId) -> Result<Money, StoreError> {
        let cents: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total), 0) FROM invoices WHERE owner_id = ?1 AND status IN ('sent', 'overdue')",
            [owner.as_str()],
            |row| row.get(0),
        )?;
        Ok(Money::from_cents(cents))
    }
}
