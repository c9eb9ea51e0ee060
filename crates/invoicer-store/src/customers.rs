use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::instrument;

use invoicer_core::ids::{CustomerId, UserId};

use crate::error::StoreError;
use crate::row_helpers::{escape_like, get, now_ts, parse_ts};

#[derive(Clone, Debug, Serialize)]
pub struct CustomerRow {
    pub id: CustomerId,
    pub owner_id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Editable customer fields.
#[derive(Clone, Debug, Default)]
pub struct CustomerFields {
    pub name: String,
    pub email: Option<String>,
    pub address: Option<String>,
}

const COLUMNS: &str = "id, owner_id, name, email, address, created_at, updated_at";

fn from_row(row: &rusqlite::Row<'_>) -> Result<CustomerRow, StoreError> {
    Ok(CustomerRow {
        id: CustomerId::from_raw(get::<String>(row, 0, "customers", "id")?),
        owner_id: UserId::from_raw(get::<String>(row, 1, "customers", "owner_id")?),
        name: get(row, 2, "customers", "name")?,
        email: get(row, 3, "customers", "email")?,
        address: get(row, 4, "customers", "address")?,
        created_at: parse_ts(&get::<String>(row, 5, "customers", "created_at")?, "customers", "created_at")?,
        updated_at: parse_ts(&get::<String>(row, 6, "customers", "updated_at")?, "customers", "updated_at")?,
    })
}

pub struct CustomerRepo;

impl CustomerRepo {
    #[instrument(skip(conn, fields), fields(owner_id = %owner))]
    pub fn create(conn: &Connection, owner: &UserId, fields: &CustomerFields) -> Result<CustomerRow, StoreError> {
        let id = CustomerId::new();
        let now = now_ts();
        conn.execute(
            "INSERT INTO customers (id, owner_id, name, email, address, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id.as_str(), owner.as_str(), fields.name, fields.email, fields.address, now],
        )?;
        Self::get(conn, &id)?.ok_or_else(|| StoreError::NotFound(format!("customer {id}")))
    }

    pub fn get(conn: &Connection, id: &CustomerId) -> Result<Option<CustomerRow>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM customers WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        let customer = rows.next()?.map(from_row).transpose()?;
        Ok(customer)
    }

    /// List customers by name. `owner = None` lists every tenant's rows.
    pub fn list(
        conn: &Connection,
        owner: Option<&UserId>,
        search: Option<&str>,
    ) -> Result<Vec<CustomerRow>, StoreError> {
        let pattern = search.map(|s| format!("%{}%", escape_like(s)));
        let sql = format!(
            "SELECT {COLUMNS} FROM customers
             WHERE (?1 IS NULL OR owner_id = ?1)
               AND (?2 IS NULL OR name LIKE ?2 ESCAPE '\\')
             ORDER BY name COLLATE NOCASE, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![owner.map(UserId::as_str), pattern])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(from_row(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(conn, fields), fields(customer_id = %id))]
    pub fn update(conn: &Connection, id: &CustomerId, fields: &CustomerFields) -> Result<bool, StoreError> {
        let changed = conn.execute(
            "UPDATE customers SET name = ?1, email = ?2, address = ?3, updated_at = ?4 WHERE id = ?5",
            params![fields.name, fields.email, fields.address, now_ts(), id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Delete a customer. Fails with `Conflict` while documents reference it.
    #[instrument(skip(conn), fields(customer_id = %id))]
    pub fn delete(conn: &Connection, id: &CustomerId) -> Result<bool, StoreError> {
        let changed = conn
            .execute("DELETE FROM customers WHERE id = ?1", [id.as_str()])
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!("customer {id} still has quotes or invoices")),
                other => other,
            })?;
        Ok(changed > 0)
    }

    pub fn count_for_owner(conn: &Connection, owner: &UserId) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM customers WHERE owner_id = ?1",
            [owner.as_str()],
            |row| row.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_user, test_db};

    fn acme() -> CustomerFields {
        CustomerFields {
            name: "Acme".into(),
            email: Some("billing@acme.test".into()),
            address: None,
        }
    }

    #[test]
    fn create_update_delete() {
        let db = test_db();
        db.with_conn(|conn| {
            let owner = seed_user(conn, "a@example.com");
            let c = CustomerRepo::create(conn, &owner, &acme())?;
            assert_eq!(c.owner_id, owner);
            assert_eq!(c.email.as_deref(), Some("billing@acme.test"));

            let renamed = CustomerFields {
                name: "Acme Ltd".into(),
                ..acme()
            };
            assert!(CustomerRepo::update(conn, &c.id, &renamed)?);
            assert_eq!(CustomerRepo::get(conn, &c.id)?.unwrap().name, "Acme Ltd");

            assert!(CustomerRepo::delete(conn, &c.id)?);
            assert!(CustomerRepo::get(conn, &c.id)?.is_none());
            assert!(!CustomerRepo::delete(conn, &c.id)?);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn list_is_scoped_to_owner() {
        let db = test_db();
        db.with_conn(|conn| {
            let a = seed_user(conn, "a@example.com");
            let b = seed_user(conn, "b@example.com");
            CustomerRepo::create(conn, &a, &acme())?;
            CustomerRepo::create(conn, &b, &CustomerFields { name: "Globex".into(), ..Default::default() })?;

            let mine = CustomerRepo::list(conn, Some(&a), None)?;
            assert_eq!(mine.len(), 1);
            assert_eq!(mine[0].name, "Acme");
            assert_eq!(CustomerRepo::list(conn, None, None)?.len(), 2);
            assert_eq!(CustomerRepo::count_for_owner(conn, &b)?, 1);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn search_escapes_wildcards() {
        let db = test_db();
        db.with_conn(|conn| {
            let a = seed_user(conn, "a@example.com");
            CustomerRepo::create(conn, &a, &CustomerFields { name: "100% Cotton".into(), ..Default::default() })?;
            CustomerRepo::create(conn, &a, &CustomerFields { name: "1000 Widgets".into(), ..Default::default() })?;

            let hits = CustomerRepo::list(conn, Some(&a), Some("100%"))?;
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].name, "100% Cotton");
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }
}
