//! Line item storage shared by quotes and invoices.

use rusqlite::{params, Connection};

use invoicer_core::ids::ItemId;
use invoicer_core::{LineItem, Money};

use crate::error::StoreError;
use crate::row_helpers::get;

#[derive(Clone, Copy, Debug)]
pub(crate) enum LineTable {
    Quote,
    Invoice,
}

impl LineTable {
    fn name(self) -> &'static str {
        match self {
            Self::Quote => "quote_lines",
            Self::Invoice => "invoice_lines",
        }
    }
}

pub(crate) fn load(conn: &Connection, table: LineTable, document_id: &str) -> Result<Vec<LineItem>, StoreError> {
    let name = table.name();
    let sql = format!(
        "SELECT item_id, description, unit_price, quantity FROM {name}
         WHERE document_id = ?1 ORDER BY position"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([document_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LineItem {
            item_id: get::<Option<String>>(row, 0, name, "item_id")?.map(ItemId::from_raw),
            description: get(row, 1, name, "description")?,
            unit_price: Money::from_cents(get(row, 2, name, "unit_price")?),
            quantity: get(row, 3, name, "quantity")?,
        });
    }
    Ok(out)
}

/// Replace every line of a document, preserving the given order.
pub(crate) fn replace(
    conn: &Connection,
    table: LineTable,
    document_id: &str,
    lines: &[LineItem],
) -> Result<(), StoreError> {
    let name = table.name();
    conn.execute(&format!("DELETE FROM {name} WHERE document_id = ?1"), [document_id])?;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {name} (document_id, position, item_id, description, unit_price, quantity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    ))?;
    for (position, line) in lines.iter().enumerate() {
        stmt.execute(params![
            document_id,
            position as i64,
            line.item_id.as_ref().map(ItemId::as_str),
            line.description,
            line.unit_price.cents(),
            line.quantity,
        ])?;
    }
    Ok(())
}
