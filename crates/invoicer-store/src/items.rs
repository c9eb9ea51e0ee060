use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::ids::{ItemId, UserId};
use invoicer_core::Money;

use crate::error::StoreError;
use crate::row_helpers::{get, now_ts, parse_ts};

/// A catalogue entry lines can be priced from.
#[derive(Clone, Debug, Serialize)]
pub struct ItemRow {
    pub id: ItemId,
    pub owner_id: UserId,
    pub name: String,
    pub description: String,
    pub unit_price: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ItemFields {
    pub name: String,
    pub description: String,
    pub unit_price: Money,
}

const COLUMNS: &str = "id, owner_id, name, description, unit_price, created_at, updated_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<ItemRow, StoreError> {
    Ok(ItemRow {
        id: ItemId::from_raw(get::<String>(row, 0, "items", "id")?),
        owner_id: UserId::from_raw(get::<String>(row, 1, "items", "owner_id")?),
        name: get(row, 2, "items", "name")?,
        description: get(row, 3, "items", "description")?,
        unit_price: Money::from_cents(get(row, 4, "items", "unit_price")?),
        created_at: parse_ts(&get::<String>(row, 5, "items", "created_at")?, "items", "created_at")?,
        updated_at: parse_ts(&get::<String>(row, 6, "items", "updated_at")?, "items", "updated_at")?,
    })
}

pub struct ItemRepo;

impl ItemRepo {
    #[instrument(skip(conn, fields), fields(owner_id = %owner))]
    pub fn create(conn: &Connection, owner: &UserId, fields: &ItemFields) -> Result<ItemRow, StoreError> {
        let id = ItemId::new();
        let now = now_ts();
        conn.execute(
            "INSERT INTO items (id, owner_id, name, description, unit_price, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id.as_str(),
                owner.as_str(),
                fields.name,
                fields.description,
                fields.unit_price.cents(),
                now
            ],
        )?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound(format!("item {id}")))
    }

    pub fn get(conn: &Connection, id: &ItemId) -> Result<Option<ItemRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM items WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let item = rows.next()?.map(from_row).transpose()?;
        Ok(item)
    }

    /// `owner = None` lists every tenant's items.
    pub fn list(conn: &Connection, owner: Option<&UserId>) -> Result<Vec<ItemRow>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM items WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY name COLLATE NOCASE, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([owner.map(UserId::as_str)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(conn, fields), fields(item_id = %id))]
    pub fn update(conn: &Connection, id: &ItemId, fields: &ItemFields) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE items SET name = ?1, description = ?2, unit_price = ?3, updated_at = ?4 WHERE id = ?5",
            params![fields.name, fields.description, fields.unit_price.cents(), now_ts(), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Lines priced from a deleted item keep their own copy of the price.
    #[instrument(skip(conn), fields(item_id = %id))]
    pub fn delete(conn: &Connection, id: &ItemId) -> Result<bool, StoreError> {
        let changed = conn.execute("DELETE FROM items WHERE id = ?1", [id.as_str()])?;
        Ok(changed > 0)
    }

    pub fn count_for_owner(conn: &Connection, owner: &UserId) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM items WHERE owner_id = ?1", [owner.as_str()], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_user, test_db};

    #[test]
    fn crud_round() {
        let db = test_db();
        db.with_conn(|conn| {
            let owner = seed_user(conn, "a@example.com");
            let item = ItemRepo::create(
                conn,
                &owner,
                &ItemFields {
                    name: "Consulting hour".into(),
                    description: "Senior".into(),
                    unit_price: Money::from_cents(12_500),
                },
            )?;
            assert_eq!(item.unit_price.cents(), 12_500);

            let cheaper = ItemFields {
                name: "Consulting hour".into(),
                description: "Junior".into(),
                unit_price: Money::from_cents(8_000),
            };
            assert!(ItemRepo::update(conn, &item.id, &cheaper)?);
            let fetched = ItemRepo::get(conn, &item.id)?.unwrap();
            assert_eq!(fetched.unit_price.cents(), 8_000);
            assert!(fetched.updated_at >= fetched.created_at);

            assert_eq!(ItemRepo::list(conn, Some(&owner))?.len(), 1);
            assert!(ItemRepo::delete(conn, &item.id)?);
            assert_eq!(ItemRepo::count_for_owner(conn, &owner)?, 0);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }
}
