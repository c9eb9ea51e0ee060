//! Quotes and their lines.
//!
//! Derived totals are written only through [`QuoteRepo::store_totals`], the
//! quiet save: it touches the four derived columns and nothing else.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::ids::{CustomerId, InvoiceId, QuoteId, UserId};
use invoicer_core::status::QuoteStatus;
use invoicer_core::{LineItem, Money, Totals};

use crate::error::StoreError;
use crate::lines::{self, LineTable};
use crate::row_helpers::{get, now_ts, parse_enum, parse_opt_date, parse_ts};

#[derive(Clone, Debug, Serialize)]
pub struct QuoteRow {
    pub id: QuoteId,
    pub owner_id: UserId,
    pub customer_id: CustomerId,
    pub number: String,
    pub status: QuoteStatus,
    /// Requested discount; `totals.discount` is the amount actually applied.
    pub discount: Money,
    pub totals: Totals,
    pub valid_until: Option<NaiveDate>,
    /// Set once the quote has been converted.
    pub invoice_id: Option<InvoiceId>,
    pub lines: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct QuoteFields {
    pub customer_id: CustomerId,
    pub discount: Money,
    pub valid_until: Option<NaiveDate>,
}

const COLUMNS: &str = "id, owner_id, customer_id, number, status, discount, subtotal, discount_total, tax, total, \
                       valid_until, invoice_id, created_at, updated_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<QuoteRow, StoreError> {
    const TABLE: &str = "quotes";
    Ok(QuoteRow {
        id: QuoteId::from_raw(get::<String>(row, 0, TABLE, "id")?),
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
        valid_until: parse_opt_date(get(row, 10, TABLE, "valid_until")?, TABLE, "valid_until")?,
        invoice_id: get::<Option<String>>(row, 11, TABLE, "invoice_id")?.map(InvoiceId::from_raw),
        lines: Vec::new(),
        created_at: parse_ts(&get::<String>(row, 12, TABLE, "created_at")?, TABLE, "created_at")?,
        updated_at: parse_ts(&get::<String>(row, 13, TABLE, "updated_at")?, TABLE, "updated_at")?,
    })
}

pub struct QuoteRepo;

impl QuoteRepo {
    /// Insert a draft quote with the next per-owner number (`Q-000001`).
    /// Totals start at zero until the caller stores computed ones.
    #[instrument(skip(conn, fields, lines), fields(owner_id = %owner))]
    pub fn create(
        conn: &Connection,
        owner: &UserId,
        fields: &QuoteFields,
        lines: &[LineItem],
    ) -> Result<QuoteRow, StoreError> {
        let id = QuoteId::new();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM quotes WHERE owner_id = ?1",
            [owner.as_str()],
            |row| row.get(0),
        )?;
        let number = format!("Q-{seq:06}");
        let now = now_ts();
        conn.execute(
            "INSERT INTO quotes (id, owner_id, customer_id, seq, number, status, discount, valid_until, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id.as_str(),
                owner.as_str(),
                fields.customer_id.as_str(),
                seq,
                number,
                QuoteStatus::Draft.as_str(),
                fields.discount.cents(),
                fields.valid_until.map(|d| d.to_string()),
                now,
            ],
        )?;
        lines::replace(conn, LineTable::Quote, id.as_str(), lines)?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound(format!("quote {id}")))
    }

    pub fn get(conn: &Connection, id: &QuoteId) -> Result<Option<QuoteRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM quotes WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let Some(mut quote) = rows.next()?.map(from_row).transpose()? else {
            return Ok(None);
        };
        quote.lines = lines::load(conn, LineTable::Quote, id.as_str())?;
        Ok(Some(quote))
    }

    /// Newest first. `owner = None` lists every tenant's quotes.
    pub fn list(conn: &Connection, owner: Option<&UserId>) -> Result<Vec<QuoteRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM quotes WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY created_at DESC, id DESC");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([owner.map(UserId::as_str)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut quote = from_row(row)?;
            quote.lines = lines::load(conn, LineTable::Quote, quote.id.as_str())?;
            out.push(quote);
        }
        Ok(out)
    }

    #[instrument(skip(conn, fields), fields(quote_id = %id))]
    pub fn update(conn: &Connection, id: &QuoteId, fields: &QuoteFields) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE quotes SET customer_id = ?1, discount = ?2, valid_until = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                fields.customer_id.as_str(),
                fields.discount.cents(),
                fields.valid_until.map(|d| d.to_string()),
                now_ts(),
                id.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    #[instrument(skip(conn, lines), fields(quote_id = %id, lines = lines.len()))]
    pub fn replace_lines(conn: &Connection, id: &QuoteId, lines: &[LineItem]) -> Result<(), StoreError> {
        lines::replace(conn, LineTable::Quote, id.as_str(), lines)?;
        conn.execute("UPDATE quotes SET updated_at = ?1 WHERE id = ?2", params![now_ts(), id.as_str()])?;
        Ok(())
    }

    #[instrument(skip(conn), fields(quote_id = %id, status = %status))]
    pub fn set_status(conn: &Connection, id: &QuoteId, status: QuoteStatus) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE quotes SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_ts(), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn link_invoice(conn: &Connection, id: &QuoteId, invoice: &InvoiceId) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE quotes SET invoice_id = ?1 WHERE id = ?2",
            params![invoice.as_str(), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Quiet save of derived totals. Does not bump `updated_at`.
    pub fn store_totals(conn: &Connection, id: &QuoteId, totals: &Totals) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE quotes SET subtotal = ?1, discount_total = ?2, tax = ?3, total = ?4 WHERE id = ?5",
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

    #[instrument(skip(conn), fields(quote_id = %id))]
    pub fn delete(conn: &Connection, id: &QuoteId) -> Result<bool, StoreError> {
        let changed = conn.execute("DELETE FROM quotes WHERE id = ?1", [id.as_str()])?;
        Ok(changed > 0)
    }

    /// Quote count per status for one owner.
    pub fn status_counts(conn: &Connection, owner: &UserId) -> Result<Vec<(QuoteStatus, i64)>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM quotes WHERE owner_id = ?1 GROUP BY status ORDER BY status")?;
        let mut rows = stmt.query([owner.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let status = parse_enum(&get::<String>(row, 0, "quotes", "status")?, "quotes", "status")?;
            out.push((status, get(row, 1, "quotes", "count")?));
        }
        Ok(out)
    }
}
