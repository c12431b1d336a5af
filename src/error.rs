use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::insight::InsightError;
use crate::token::TokenError;
use crate::units::UnitError;

/// Failures of a single ledger interaction.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("gas estimation failed, the call would revert: {0}")]
    Estimation(String),

    #[error("transaction rejected by the network: {0}")]
    Submission(String),

    #[error("nonce collision for {account}: {message}")]
    NonceCollision { account: Address, message: String },

    #[error("transaction {hash} was not confirmed within {waited:?}")]
    Timeout { hash: TxHash, waited: Duration },

    #[error("transaction {0} was included but reverted")]
    Reverted(TxHash),

    #[error("receipt of {hash} carries no {event} event")]
    MissingEvent { hash: TxHash, event: &'static str },

    #[error("malformed ledger response: {0}")]
    Decode(String),

    #[error("ledger endpoint unavailable: {0}")]
    Transport(String),
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Estimation(_) => "estimation",
            Self::Submission(_) => "submission",
            Self::NonceCollision { .. } => "nonce_collision",
            Self::Timeout { .. } => "timeout",
            Self::Reverted(_) => "reverted",
            Self::MissingEvent { .. } => "missing_event",
            Self::Decode(_) => "decode",
            Self::Transport(_) => "transport",
        }
    }

    /// Only a nonce race is worth resubmitting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NonceCollision { .. })
    }
}

/// Caller-facing error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Insight(#[from] InsightError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Ledger(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Insight(e) => e.kind(),
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Ledger(e) if e.is_retryable())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Token(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Insight(InsightError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Insight(InsightError::InvalidImage(_)) => StatusCode::BAD_REQUEST,
            Self::Insight(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UnitError> for AppError {
    fn from(err: UnitError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    kind: &'static str,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            kind: self.kind(),
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_nonce_collisions_are_retryable() {
        let collision = LedgerError::NonceCollision {
            account: Address::ZERO,
            message: "nonce too low".into(),
        };
        assert!(collision.is_retryable());
        assert!(AppError::from(collision).is_retryable());

        assert!(!LedgerError::Estimation("revert".into()).is_retryable());
        assert!(!LedgerError::Reverted(TxHash::ZERO).is_retryable());
    }

    #[test]
    fn ledger_failures_map_to_server_errors() {
        let err = AppError::from(LedgerError::Submission("insufficient funds".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "submission");
        assert_eq!(AppError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::validation("x").status_code(), StatusCode::BAD_REQUEST);
    }
}
