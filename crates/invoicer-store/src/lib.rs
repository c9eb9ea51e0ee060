pub mod audit;
pub mod customers;
pub mod database;
pub mod error;
pub mod invoices;
mod lines;
pub mod items;
pub mod notifications;
pub mod quotes;
pub mod row_helpers;
pub mod schema;
pub mod users;
pub mod web_sessions;

#[cfg(test)]
mod testing;

pub use database::Database;
pub use error::StoreError;
