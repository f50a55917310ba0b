//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lifeline_core::emergency::{EmergencyError, ErrorKind, FieldViolation};
use lifeline_core::geo::GeoIndexError;
use lifeline_core::rate_limit::RateLimitError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A lifecycle operation failed.
    #[error(transparent)]
    Emergency(#[from] EmergencyError),

    /// The requester headers are missing or malformed.
    #[error("missing or invalid requester identity: {0}")]
    Unauthenticated(String),

    /// The requester may not perform this action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A query string or body could not be parsed.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// The client exceeded its request budget.
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// Endpoint exists but its backend is not wired in this deployment.
    #[error("{0} not available")]
    Unavailable(&'static str),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldViolation>,
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Validation / bad request: 400
    /// - Missing identity: 401
    /// - Access denied: 403
    /// - Not found: 404
    /// - Invalid state / conflict: 409
    /// - Rate limited: 429
    /// - Collaborator or unwired backend: 503
    /// - Store / internal: 500
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Emergency(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
                ErrorKind::InvalidState | ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Collaborator => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the response body. Internal details never reach the client.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Emergency(e) => ErrorBody {
                code: e.code(),
                message: e.public_message(),
                fields: e.violations().to_vec(),
            },
            Self::Unauthenticated(reason) => ErrorBody {
                code: "UNAUTHENTICATED",
                message: reason.clone(),
                fields: Vec::new(),
            },
            Self::Forbidden(reason) => ErrorBody {
                code: "UNAUTHORIZED",
                message: reason.clone(),
                fields: Vec::new(),
            },
            Self::BadRequest(reason) => ErrorBody {
                code: "BAD_REQUEST",
                message: reason.clone(),
                fields: Vec::new(),
            },
            Self::RateLimited(_) => ErrorBody {
                code: "RATE_LIMITED",
                message: "Rate limit exceeded".to_string(),
                fields: Vec::new(),
            },
            Self::Unavailable(what) => ErrorBody {
                code: "SERVICE_UNAVAILABLE",
                message: format!("{what} not available"),
                fields: Vec::new(),
            },
            Self::Internal(_) => ErrorBody {
                code: "INTERNAL_ERROR",
                message: "Internal server error".to_string(),
                fields: Vec::new(),
            },
        }
    }
}

impl From<GeoIndexError> for ApiError {
    fn from(error: GeoIndexError) -> Self {
        match error {
            GeoIndexError::InvalidQuery { reason } => Self::BadRequest(reason),
            other => Self::Emergency(EmergencyError::collaborator(
                "geo_index",
                other.to_string(),
            )),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::from(EmergencyError::invalid_field("title", "must not be empty"))
                .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(EmergencyError::not_found("e1")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EmergencyError::unauthorized("e1", "u2")).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(EmergencyError::Conflict {
                emergency_id: "e1".into(),
                attempts: 4
            })
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(EmergencyError::collaborator("geo_index", "down")).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(EmergencyError::store("disk full")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Unauthenticated("missing".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let body = ApiError::from(EmergencyError::store("/var/lib/lifeline.db: locked")).body();
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert!(!body.message.contains("lifeline.db"));

        let body = ApiError::Internal("secret detail".into()).body();
        assert!(!body.message.contains("secret"));
    }

    #[test]
    fn test_validation_body_lists_fields() {
        let error = EmergencyError::validation(vec![
            FieldViolation::new("title", "must not be empty"),
            FieldViolation::new("location.address", "must not be empty"),
        ]);
        let body = ApiError::from(error).body();
        assert_eq!(body.code, "VALIDATION_ERROR");
        assert_eq!(body.fields.len(), 2);
    }
}
