use crate::models::ValidationIssue;
use crate::store::StoreError;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("identity provider failed: {0}")]
    Identity(String),
    #[error("no signed-in user")]
    NotSignedIn,
    #[error("malformed {entity} record {id}: {reason}")]
    Malformed {
        entity: &'static str,
        id: String,
        reason: String,
    },
    #[error("validation failed")]
    Validation(Vec<ValidationIssue>),
    #[error("room {room_id} kept: deleted {deleted} submissions, {failed} deletes failed")]
    PartialCascade {
        room_id: String,
        deleted: usize,
        failed: usize,
    },
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub field: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Vec<ErrorDetail>,
    pub request_id: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn from_service(err: ServiceError, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        match err {
            ServiceError::NotFound { .. } | ServiceError::Store(StoreError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string(), request_id)
            }
            ServiceError::NotSignedIn => Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string(), request_id),
            ServiceError::Identity(_) => Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", err.to_string(), request_id),
            ServiceError::Validation(issues) => Self::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "validation failed",
                request_id,
            )
            .with_details(
                issues
                    .into_iter()
                    .map(|i| ErrorDetail {
                        field: i.field,
                        issue: i.issue,
                    })
                    .collect(),
            ),
            ServiceError::Store(StoreError::Unavailable(_)) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE", err.to_string(), request_id)
            }
            ServiceError::PartialCascade { .. } => {
                tracing::error!("{}", err);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "PARTIAL_CASCADE", err.to_string(), request_id)
            }
            ServiceError::Store(_) | ServiceError::Malformed { .. } => {
                tracing::error!("internal error: {}", err);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal error", request_id)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: ErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_status_codes() {
        let not_found = AppError::from_service(ServiceError::not_found("room", "r1"), "req");
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.request_id, "req");

        let anonymous = AppError::from_service(ServiceError::NotSignedIn, "req");
        assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
        assert_eq!(anonymous.code, "UNAUTHORIZED");

        let transient = AppError::from_service(StoreError::Unavailable("timeout".into()).into(), "req");
        assert_eq!(transient.status, StatusCode::SERVICE_UNAVAILABLE);

        let invalid = AppError::from_service(
            ServiceError::Validation(vec![ValidationIssue {
                field: "title".into(),
                issue: "must not be empty".into(),
            }]),
            "req",
        );
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.details.len(), 1);
    }
}
