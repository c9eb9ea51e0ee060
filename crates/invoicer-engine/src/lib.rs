//! Business logic for the invoicer: entity services, observers, the
//! session gateway and the retention sweep.

pub mod app;
pub mod audit;
pub mod auth;
pub mod error;
pub mod exports;
pub mod notify;
pub mod observers;
pub mod passwords;
pub mod retention;
pub mod scheduler;
pub mod services;
pub mod totals;

pub use app::Engine;
pub use error::EngineError;
