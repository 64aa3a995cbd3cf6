use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::stock_ledger::InsufficientStock;

/// Body returned for errors that abort a request outright.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Internal Server Error")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// Machine-readable error codes carried in mutation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationErrorCode {
    Invalid,
    NotFound,
    InsufficientStock,
    DeliveryMethodNotApplicable,
    PaymentError,
    InvalidOrderStatusForAction,
    CannotCancel,
    Conflict,
}

/// A typed, field-attributed error reported next to a mutation's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub code: MutationErrorCode,
    pub message: String,
    /// Order or checkout lines the error refers to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Uuid>,
}

impl MutationError {
    pub fn new(field: Option<&str>, code: MutationErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            code,
            message: message.into(),
            lines: Vec::new(),
            variants: Vec::new(),
        }
    }
}

/// Reason a payment operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorCode {
    NotFound,
    Inactive,
    InvalidStatus,
    InvalidAmount,
    AmountExceeded,
    NotCovered,
    GatewayFailure,
    AlreadyPaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct PaymentError {
    pub code: PaymentErrorCode,
    pub message: String,
}

impl PaymentError {
    pub fn new(code: PaymentErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn inactive() -> Self {
        Self::new(
            PaymentErrorCode::Inactive,
            "This payment is no longer active",
        )
    }
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

    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Insufficient stock for {} line(s)", .0.items.len())]
    InsufficientStock(InsufficientStock),

    #[error("Delivery method not applicable: {message}")]
    DeliveryMethodNotApplicable { field: String, message: String },

    #[error("Payment error: {0}")]
    Payment(PaymentError),

    #[error("Action not allowed for order status: {0}")]
    InvalidOrderStatusForAction(String),

    #[error("Cannot cancel: {0}")]
    CannotCancel(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

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

impl From<PaymentError> for ServiceError {
    fn from(err: PaymentError) -> Self {
        ServiceError::Payment(err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        ServiceError::InvalidField {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound(format!("{entity} {id} not found"))
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidField { .. } | Self::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientStock(_)
            | Self::DeliveryMethodNotApplicable { .. }
            | Self::InvalidOrderStatusForAction(_)
            | Self::CannotCancel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Payment(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Infrastructure failures abort the request; everything else is reported
    /// in the mutation's error list.
    pub fn is_infrastructure(&self) -> bool {
        self.mutation_error().is_none()
    }

    /// Converts business and validation failures into a typed mutation error.
    pub fn mutation_error(&self) -> Option<MutationError> {
        let error = match self {
            Self::NotFound(msg) => MutationError::new(None, MutationErrorCode::NotFound, msg.clone()),
            Self::ValidationError(msg) => {
                MutationError::new(None, MutationErrorCode::Invalid, msg.clone())
            }
            Self::InvalidField { field, message } => {
                MutationError::new(Some(field), MutationErrorCode::Invalid, message.clone())
            }
            Self::InvalidOperation(msg) => {
                MutationError::new(None, MutationErrorCode::Invalid, msg.clone())
            }
            Self::InsufficientStock(insufficient) => {
                let mut error = MutationError::new(
                    Some("lines"),
                    MutationErrorCode::InsufficientStock,
                    self.to_string(),
                );
                error.lines = insufficient
                    .items
                    .iter()
                    .filter_map(|item| item.line_id)
                    .collect();
                error.variants = insufficient.items.iter().map(|item| item.variant_id).collect();
                error
            }
            Self::DeliveryMethodNotApplicable { field, message } => MutationError::new(
                Some(field),
                MutationErrorCode::DeliveryMethodNotApplicable,
                message.clone(),
            ),
            Self::Payment(err) => {
                MutationError::new(Some("payment"), MutationErrorCode::PaymentError, err.message.clone())
            }
            Self::InvalidOrderStatusForAction(msg) => MutationError::new(
                Some("status"),
                MutationErrorCode::InvalidOrderStatusForAction,
                msg.clone(),
            ),
            Self::CannotCancel(msg) => {
                MutationError::new(Some("id"), MutationErrorCode::CannotCancel, msg.clone())
            }
            Self::Conflict(msg) => MutationError::new(None, MutationErrorCode::Conflict, msg.clone()),
            Self::ConcurrentModification(id) => MutationError::new(
                Some("id"),
                MutationErrorCode::Conflict,
                format!("Concurrent modification for ID {id}"),
            ),
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => return None,
        };
        Some(error)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stock_ledger::InsufficientStockItem;
    use axum::body::to_bytes;

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Payment(PaymentError::inactive()).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ServiceError::InvalidOrderStatusForAction("draft".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("password=secret".into())).response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::InternalError("stack".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order 1 not found".into()).response_message(),
            "Not found: Order 1 not found"
        );
    }

    #[test]
    fn insufficient_stock_becomes_line_attributed_mutation_error() {
        let line_id = Uuid::new_v4();
        let variant_id = Uuid::new_v4();
        let err = ServiceError::InsufficientStock(InsufficientStock {
            items: vec![InsufficientStockItem {
                variant_id,
                line_id: Some(line_id),
                warehouse_id: None,
                requested: 2,
                available: 1,
            }],
        });

        let mutation_error = err.mutation_error().unwrap();
        assert_eq!(mutation_error.code, MutationErrorCode::InsufficientStock);
        assert_eq!(mutation_error.lines, vec![line_id]);
        assert_eq!(mutation_error.variants, vec![variant_id]);
    }

    #[test]
    fn infrastructure_errors_have_no_mutation_error() {
        assert!(ServiceError::DatabaseError(DbErr::Custom("down".into())).is_infrastructure());
        assert!(!ServiceError::Conflict("stale".into()).is_infrastructure());
    }

    #[tokio::test]
    async fn into_response_uses_opaque_body_for_database_errors() {
        let response = ServiceError::DatabaseError(DbErr::Custom("conn refused".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.message, "Database error");
    }
}
