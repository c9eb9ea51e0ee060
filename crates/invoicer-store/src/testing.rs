//! Fixtures shared by the repository tests.

use rusqlite::Connection;

use invoicer_core::ids::{CustomerId, UserId};

use crate::customers::{CustomerFields, CustomerRepo};
use crate::users::UserRepo;
use crate::Database;

pub(crate) fn test_db() -> Database {
    Database::in_memory().unwrap()
}

pub(crate) fn seed_user(conn: &Connection, email: &str) -> UserId {
    UserRepo::create(conn, email, "Test User", "$argon2id$test", false).unwrap().id
}

pub(crate) fn seed_customer(conn: &Connection, owner: &UserId) -> CustomerId {
    CustomerRepo::create(
        conn,
        owner,
        &CustomerFields {
            name: "Acme".into(),
            ..Default::default()
        },
    )
    .unwrap()
    .id
}
