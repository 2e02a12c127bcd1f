use crate::db::errors::DbError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error as ThisError;

/// Why a signed token was rejected before any store lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    InvalidSignature,
    WrongType,
    Expired,
}

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenRejection::InvalidSignature => f.write_str("invalid signature"),
            TokenRejection::WrongType => f.write_str("wrong token type"),
            TokenRejection::Expired => f.write_str("expired"),
        }
    }
}

/// Failure talking to an upstream HTTP API (payment provider or vending API)
#[derive(ThisError, Debug)]
pub enum ProviderError {
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status { service: &'static str, status: u16, body: String },

    #[error("{service} returned an unexpected payload: {message}")]
    Decode { service: &'static str, message: String },

    #[error("{service} did not answer within the deadline")]
    Timeout { service: &'static str },
}

const SESSION_INVALID: &str = "Session invalid, please log in again";

#[derive(ThisError, Debug)]
pub enum Error {
    /// A proof for this provider payment already exists
    #[error("Payment {provider_payment_id} was already registered")]
    DuplicateProof { provider_payment_id: String },

    /// No provider payment matches the submission
    #[error("No matching payment found")]
    PaymentNotFound,

    /// More than one provider payment matches the asserted details
    #[error("{count} payments match the given details")]
    PaymentAmbiguous { count: usize, hints: Vec<&'static str> },

    /// The voucher stock is exhausted (or every remaining row is locked)
    #[error("No vouchers available")]
    NoAvailableVouchers,

    /// Refresh token unknown, wrong type, expired, or revoked outside of rotation
    #[error("Refresh token invalid")]
    RefreshInvalid,

    /// A rotated refresh token was presented again; its family has been revoked
    #[error("Refresh token reuse detected")]
    RefreshReuseDetected,

    #[error("Reset password token invalid")]
    ResetTokenInvalid,

    #[error("User not found")]
    UserNotFound,

    /// Input or business-rule violation
    #[error("{message}")]
    ValidationFailed { message: String },

    /// Token rejected on signature, type or expiry
    #[error("Invalid token: {reason}")]
    InvalidToken { reason: TokenRejection },

    #[error("Voucher not found")]
    VoucherNotFound,

    #[error("Proof not found")]
    ProofNotFound,

    /// Upstream API failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The caller cancelled the operation; any open transaction was rolled back
    #[error("Operation cancelled")]
    Cancelled,

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::ValidationFailed { message: message.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::DuplicateProof { .. } => StatusCode::CONFLICT,
            Error::PaymentNotFound => StatusCode::NOT_FOUND,
            Error::PaymentAmbiguous { .. } => StatusCode::CONFLICT,
            Error::NoAvailableVouchers => StatusCode::SERVICE_UNAVAILABLE,
            Error::RefreshInvalid | Error::RefreshReuseDetected => StatusCode::UNAUTHORIZED,
            Error::ResetTokenInvalid => StatusCode::BAD_REQUEST,
            Error::UserNotFound => StatusCode::NOT_FOUND,
            Error::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidToken { .. } => StatusCode::UNAUTHORIZED,
            Error::VoucherNotFound | Error::ProofNotFound => StatusCode::NOT_FOUND,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            // nginx's "client closed request"
            Error::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::DuplicateProof { .. } => "This payment was already used to earn a stamp".to_string(),
            Error::PaymentNotFound => "We could not find a payment matching those details".to_string(),
            Error::PaymentAmbiguous { hints, .. } if hints.is_empty() => {
                "Several payments match those details, please use the payment id instead".to_string()
            }
            Error::PaymentAmbiguous { hints, .. } => {
                format!("Several payments match those details, please also provide: {}", hints.join(", "))
            }
            Error::NoAvailableVouchers => "No vouchers are available right now, please try again later".to_string(),
            // Reuse detection surfaces exactly like a plain invalid session
            Error::RefreshInvalid | Error::RefreshReuseDetected => SESSION_INVALID.to_string(),
            Error::ResetTokenInvalid => "This reset link is invalid or has expired".to_string(),
            Error::UserNotFound => "User not found".to_string(),
            Error::ValidationFailed { message } => message.clone(),
            Error::InvalidToken { .. } => "Authentication required".to_string(),
            Error::VoucherNotFound => "Voucher not found".to_string(),
            Error::ProofNotFound => "Proof not found".to_string(),
            Error::Provider(_) => "An upstream service is unavailable, please try again later".to_string(),
            Error::Cancelled => "Request cancelled".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Provider(_) => {
                tracing::error!("Upstream service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::RefreshReuseDetected => {
                tracing::warn!("Refresh token reuse rejected");
            }
            Error::RefreshInvalid | Error::ResetTokenInvalid | Error::InvalidToken { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::NoAvailableVouchers => {
                tracing::warn!("Voucher stock exhausted");
            }
            Error::DuplicateProof { .. }
            | Error::PaymentNotFound
            | Error::PaymentAmbiguous { .. }
            | Error::UserNotFound
            | Error::ValidationFailed { .. }
            | Error::VoucherNotFound
            | Error::ProofNotFound
            | Error::Cancelled => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::PaymentAmbiguous { count, hints } => {
                let body = json!({
                    "message": self.user_message(),
                    "matches": count,
                    "missing_fields": hints,
                });
                (status, axum::response::Json(body)).into_response()
            }
            Error::DuplicateProof { provider_payment_id } => {
                let body = json!({
                    "message": self.user_message(),
                    "payment_id": provider_payment_id,
                });
                (status, axum::response::Json(body)).into_response()
            }
            _ => (status, self.user_message()).into_response(),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
