use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{error::DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// The closed set of error codes a client of the checkout, payment and
/// shipment endpoints can observe. Internals retry behind these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CartEmpty,
    OrderCreateFailed,
    AddressMissing,
    PaymentVerificationFailed,
    InvalidOrderState,
    NotFound,
    ValidationFailed,
    ServerError,
}

/// Error body returned by every HTTP endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code
    pub code: ErrorCode,
    /// Human-readable description, never containing internal details
    pub message: String,
    /// Whether repeating the same request later may succeed
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is empty")]
    CartEmpty,

    #[error("No default shipping address for this order")]
    AddressMissing,

    #[error("Order creation failed: {0}")]
    OrderCreateFailed(String),

    #[error("Invalid order status: {0}")]
    InvalidStatus(String),

    #[error("Payment verification failed: {0}")]
    PaymentVerificationFailed(String),

    #[error("Shipment creation already in progress for order {0}")]
    ShipmentInProgress(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("External call timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Convenience constructor for wrapping string-based database errors.
    pub fn database_error_message(message: impl Into<String>) -> Self {
        ServiceError::DatabaseError(DbErr::Custom(message.into()))
    }

    /// True when the underlying database error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::DatabaseError(err) => is_unique_violation(err),
            _ => false,
        }
    }

    /// Client-facing error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CartEmpty => ErrorCode::CartEmpty,
            Self::AddressMissing => ErrorCode::AddressMissing,
            Self::OrderCreateFailed(_) => ErrorCode::OrderCreateFailed,
            Self::PaymentVerificationFailed(_) => ErrorCode::PaymentVerificationFailed,
            Self::InvalidStatus(_) => ErrorCode::InvalidOrderState,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::ValidationError(_) => ErrorCode::ValidationFailed,
            Self::DatabaseError(_)
            | Self::ShipmentInProgress(_)
            | Self::ExternalServiceError(_)
            | Self::Timeout(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => ErrorCode::ServerError,
        }
    }

    /// Transient failures worth repeating; everything else is a data or
    /// caller problem and must not be queued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_)
                | Self::OrderCreateFailed(_)
                | Self::ShipmentInProgress(_)
                | Self::ExternalServiceError(_)
                | Self::Timeout(_)
                | Self::Other(_)
        )
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::CartEmpty | Self::AddressMissing => {
                StatusCode::BAD_REQUEST
            }
            Self::InvalidStatus(_) => StatusCode::CONFLICT,
            Self::PaymentVerificationFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::OrderCreateFailed(_) | Self::ShipmentInProgress(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for HTTP responses. Internal errors are reduced to a
    /// generic message so nothing about the implementation leaks.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) | Self::Timeout(_) => {
                "Upstream service unavailable, the request will be retried".to_string()
            }
            Self::OrderCreateFailed(_) => {
                "Could not allocate an order number, please retry".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Unique-constraint detection that works for both Postgres and SQLite.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = %self.code(), "request failed");
        }

        let body = ErrorResponse {
            code: self.code(),
            message: self.response_message(),
            retryable: self.is_retryable(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_includes_request_id_and_code() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::CartEmpty.into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, ErrorCode::CartEmpty);
        assert!(!payload.retryable);
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        assert_eq!(ErrorCode::CartEmpty.as_ref(), "CART_EMPTY");
        assert_eq!(ErrorCode::AddressMissing.to_string(), "ADDRESS_MISSING");
        assert_eq!(
            serde_json::to_string(&ErrorCode::OrderCreateFailed).unwrap(),
            "\"ORDER_CREATE_FAILED\""
        );
    }

    #[test]
    fn internal_failures_collapse_to_server_error() {
        let errors = [
            ServiceError::database_error_message("connection reset"),
            ServiceError::ExternalServiceError("carrier 502".into()),
            ServiceError::Timeout("carrier".into()),
            ServiceError::ShipmentInProgress("2026101900001".into()),
            ServiceError::InternalError("boom".into()),
        ];
        for err in errors {
            assert_eq!(err.code(), ErrorCode::ServerError, "{err}");
        }
    }

    #[test]
    fn data_problems_are_not_retryable() {
        assert!(!ServiceError::AddressMissing.is_retryable());
        assert!(!ServiceError::CartEmpty.is_retryable());
        assert!(!ServiceError::PaymentVerificationFailed("bad signature".into()).is_retryable());
        assert!(ServiceError::ExternalServiceError("503".into()).is_retryable());
        assert!(ServiceError::OrderCreateFailed("conflict".into()).is_retryable());
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::database_error_message("password=hunter2").response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order 1 not found".into()).response_message(),
            "Not found: Order 1 not found"
        );
    }
}
