//! Error types for the identity server
//!
//! Every error carries a stable code from the service's error taxonomy; the
//! HTTP surface serializes errors as `{code, message, info?}` JSON bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Result type for identity server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for identity server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identity or endpoint missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed caveat or missing parameters
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The path exists but not for this method
    #[error("{method} not allowed for {path}")]
    MethodNotAllowed {
        /// The rejected request method
        method: String,
        /// The request path
        path: String,
    },

    /// Session pool exhausted or acquisition timed out
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The client must complete an interactive login before the discharge
    /// can proceed
    #[error("interaction required: {reason}")]
    InteractionRequired {
        /// URL the user agent should visit to log in
        visit_url: String,
        /// URL the client polls for the completed discharge
        wait_url: String,
        /// Why authorization failed in the first place
        reason: String,
    },

    /// The caveat condition names no known predicate
    #[error("caveat not recognized: {0:?}")]
    CaveatNotRecognized(String),

    /// The rendezvous TTL elapsed before completion
    #[error("rendezvous expired")]
    Expired,

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable taxonomy code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not found",
            Error::BadRequest(_) => "bad request",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::MethodNotAllowed { .. } => "method not allowed",
            Error::ServiceUnavailable(_) => "service unavailable",
            Error::InteractionRequired { .. } => "interaction required",
            Error::CaveatNotRecognized(_) => "caveat not recognized",
            Error::Expired => "expired",
            Error::Internal(_) => "internal error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InteractionRequired { .. } => StatusCode::UNAUTHORIZED,
            Error::CaveatNotRecognized(_) => StatusCode::BAD_REQUEST,
            Error::Expired => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire form of an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Taxonomy code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Extra data for codes that carry a payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let info = match &self {
            Error::InteractionRequired {
                visit_url,
                wait_url,
                ..
            } => Some(serde_json::json!({
                "VisitURL": visit_url,
                "WaitURL": wait_url,
            })),
            _ => None,
        };
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            info,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<waypost_bakery::Error> for Error {
    fn from(e: waypost_bakery::Error) -> Self {
        use waypost_bakery::Error as Bakery;
        match e {
            Bakery::CaveatNotRecognized(condition) => Error::CaveatNotRecognized(condition),
            Bakery::CaveatNotSatisfied(_) | Bakery::VerificationFailed(_) => {
                Error::Unauthorized(e.to_string())
            }
            Bakery::UnknownRootKey(_) => Error::Unauthorized(e.to_string()),
            Bakery::Decode(_) => Error::BadRequest(e.to_string()),
            Bakery::Seal(_) => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_taxonomy() {
        assert_eq!(Error::NotFound("x".into()).code(), "not found");
        assert_eq!(Error::BadRequest("x".into()).code(), "bad request");
        assert_eq!(Error::Unauthorized("x".into()).code(), "unauthorized");
        assert_eq!(Error::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(Error::Expired.code(), "expired");
        assert_eq!(
            Error::CaveatNotRecognized("is-full-moon".into()).code(),
            "caveat not recognized"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Expired.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::ServiceUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::InteractionRequired {
                visit_url: "v".into(),
                wait_url: "w".into(),
                reason: "r".into(),
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_method_not_allowed_message() {
        let err = Error::MethodNotAllowed {
            method: "PUT".into(),
            path: "/v1/wait".into(),
        };
        assert_eq!(err.to_string(), "PUT not allowed for /v1/wait");
    }

    #[test]
    fn test_bakery_error_mapping() {
        use waypost_bakery::Error as Bakery;
        assert_eq!(
            Error::from(Bakery::CaveatNotRecognized("is-full-moon".into())).code(),
            "caveat not recognized"
        );
        assert_eq!(
            Error::from(Bakery::VerificationFailed("sig".into())).code(),
            "unauthorized"
        );
        assert_eq!(
            Error::from(Bakery::Decode("id".into())).code(),
            "bad request"
        );
    }
}
