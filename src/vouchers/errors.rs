// Domain error taxonomy for the voucher and payment workflow.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::database::StoreError;
use crate::pesapal::errors::GatewayError;

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no vouchers available for package {package_slug}")]
    NoVouchersAvailable { package_slug: String },
    #[error("{0}")]
    Gateway(GatewayError),
    #[error("payment gateway timed out calling {endpoint}")]
    GatewayTimeout { endpoint: &'static str },
    #[error("payment initiation failed: {reason}")]
    PaymentInitiationFailed { reason: String },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("voucher {voucher_id} in {package_slug} was claimed concurrently")]
    ConcurrencyConflict {
        package_slug: String,
        voucher_id: String,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl VoucherError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        VoucherError::InvalidInput(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        VoucherError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VoucherError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            VoucherError::NoVouchersAvailable { .. } => StatusCode::CONFLICT,
            VoucherError::Gateway(_) | VoucherError::PaymentInitiationFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            VoucherError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            VoucherError::NotFound { .. } => StatusCode::NOT_FOUND,
            VoucherError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            VoucherError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show an end user. Gateway bodies and storage details stay in logs.
    pub fn user_message(&self) -> String {
        match self {
            VoucherError::InvalidInput(msg) => msg.clone(),
            VoucherError::NoVouchersAvailable { .. } => {
                "This package is out of stock. Please try another package or contact support."
                    .to_string()
            }
            VoucherError::Gateway(_) | VoucherError::GatewayTimeout { .. } => {
                "The payment gateway is not responding. Please try again shortly.".to_string()
            }
            VoucherError::PaymentInitiationFailed { .. } => {
                "We could not start your payment. Please try again.".to_string()
            }
            VoucherError::NotFound { kind, id } => format!("{kind} {id} was not found"),
            VoucherError::ConcurrencyConflict { .. } | VoucherError::Storage(_) => {
                "Something went wrong on our side. Please try again.".to_string()
            }
        }
    }
}

macro_rules! voucher_error_from_store {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for VoucherError {
                fn from(e: $ty) -> Self {
                    VoucherError::Storage(StoreError::from(e))
                }
            }
        )*
    };
}

voucher_error_from_store!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    serde_json::Error,
);

impl From<GatewayError> for VoucherError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Timeout { endpoint } => VoucherError::GatewayTimeout { endpoint },
            other => VoucherError::Gateway(other),
        }
    }
}

impl IntoResponse for VoucherError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.user_message() }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_timeout_is_distinct() {
        let err: VoucherError = GatewayError::Timeout {
            endpoint: "/api/Transactions/SubmitOrderRequest",
        }
        .into();
        assert!(matches!(err, VoucherError::GatewayTimeout { .. }));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let err: VoucherError = GatewayError::SchemaMismatch("bad".into()).into();
        assert!(matches!(err, VoucherError::Gateway(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_user_message_hides_gateway_body() {
        let err: VoucherError = GatewayError::Api {
            message: "invalid consumer".into(),
            raw_response: "{\"error\":{\"code\":\"invalid_consumer_key_or_secret_provided\"}}".into(),
            status: Some(401),
        }
        .into();
        assert!(!err.user_message().contains("invalid_consumer"));
    }
}
