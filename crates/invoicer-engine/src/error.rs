use invoicer_core::policy::Forbidden;
use invoicer_core::status::TransitionError;
use invoicer_core::TotalsError;
use invoicer_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Forbidden(#[from] Forbidden),

    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{what} is {status} and can no longer be changed")]
    Locked { what: String, status: String },

    #[error("invalid totals: {0}")]
    Totals(#[from] TotalsError),

    /// Deliberately identical for unknown emails and wrong passwords.
    #[error("These credentials do not match our records.")]
    InvalidCredentials,

    #[error("a retention sweep is already running")]
    SweepInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::from(e))
    }
}
