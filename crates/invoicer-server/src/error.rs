use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use invoicer_engine::EngineError;
use invoicer_store::StoreError;

/// Errors surfaced to HTTP clients. Validation failures use the
/// `{message, errors: {field: [message]}}` shape.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    CsrfMismatch,
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

fn message(text: impl Into<String>) -> Value {
    json!({ "message": text.into() })
}

fn field_error(field: &str, text: &str) -> Value {
    json!({ "message": text, "errors": { field: [text] } })
}

impl ApiError {
    fn parts(self) -> (StatusCode, Value) {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, message("Unauthenticated.")),
            Self::CsrfMismatch => (StatusCode::FORBIDDEN, message("CSRF token mismatch.")),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, message(m)),
            Self::Engine(e) => match e {
                EngineError::Validation { field, message } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, field_error(&field, &message))
                }
                EngineError::InvalidCredentials => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    field_error("email", &EngineError::InvalidCredentials.to_string()),
                ),
                EngineError::Totals(e) => (StatusCode::UNPROCESSABLE_ENTITY, field_error("lines", &e.to_string())),
                EngineError::Forbidden(f) => {
                    warn!(actor = %f.actor, ability = ?f.ability, "authorization denied");
                    (StatusCode::FORBIDDEN, message("This action is unauthorized."))
                }
                EngineError::NotFound(what) | EngineError::Store(StoreError::NotFound(what)) => {
                    (StatusCode::NOT_FOUND, message(format!("{what} not found")))
                }
                EngineError::Transition(t) => (StatusCode::CONFLICT, message(t.to_string())),
                e @ EngineError::Locked { .. } => (StatusCode::CONFLICT, message(e.to_string())),
                EngineError::Store(StoreError::Conflict(m)) => (StatusCode::CONFLICT, message(m)),
                EngineError::SweepInProgress => (StatusCode::CONFLICT, message(EngineError::SweepInProgress.to_string())),
                other => {
                    error!(error = %other, "request failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, message("Server Error"))
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoicer_core::ids::UserId;
    use invoicer_core::policy::{Ability, Forbidden};
    use invoicer_core::status::TransitionError;

    #[test]
    fn validation_names_the_field() {
        let (status, body) = ApiError::from(EngineError::validation("name", "The name field is required.")).parts();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"]["name"][0], "The name field is required.");
    }

    #[test]
    fn bad_credentials_only_flag_email() {
        let (status, body) = ApiError::from(EngineError::InvalidCredentials).parts();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["errors"]["email"][0], "These credentials do not match our records.");
        assert!(body["errors"].get("password").is_none());
    }

    #[test]
    fn status_mapping() {
        let forbidden = EngineError::Forbidden(Forbidden {
            actor: UserId::from_raw("usr_b"),
            owner: UserId::from_raw("usr_a"),
            ability: Ability::View,
        });
        let (status, body) = ApiError::from(forbidden).parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body.to_string().contains("usr_a"), "owner must not leak");

        let transition = EngineError::Transition(TransitionError {
            entity: "invoice",
            from: "paid".into(),
            to: "draft".into(),
        });
        assert_eq!(ApiError::from(transition).parts().0, StatusCode::CONFLICT);
        assert_eq!(ApiError::from(EngineError::not_found("item x")).parts().0, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Unauthenticated.parts().0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(EngineError::Internal("boom".into())).parts(),
            (StatusCode::INTERNAL_SERVER_ERROR, message("Server Error"))
        );
    }
}
