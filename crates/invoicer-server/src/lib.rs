pub mod error;
pub mod handlers;
pub mod security;
pub mod server;
pub mod session;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
