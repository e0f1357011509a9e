use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;
use crate::types::PayoutStatus;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_INVALID_TRANSITION: &str = "INVALID_TRANSITION";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_INVALID_NAME: &str = "INVALID_NAME";
pub const E_INVALID_TIER: &str = "INVALID_TIER";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_DB_FAILURE: &str = "DB_FAILURE";

/// Failures raised by the commission engine and its stores.
#[derive(Debug, Error)]
pub enum ReferralError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("payout cannot move from {from} to {to}")]
    InvalidTransition { from: PayoutStatus, to: PayoutStatus },

    #[error("{0} not found")]
    NotFound(String),

    #[error("referral code needs a first or last name")]
    InvalidName,

    #[error("invalid tier ladder: {0}")]
    InvalidTier(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage failure")]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::Error> for ReferralError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            // 23505 = unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return ReferralError::Conflict(db_err.message().to_string());
            }
        }
        ReferralError::Storage(e.into())
    }
}

pub type Result<T, E = ReferralError> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

impl ReferralError {
    /// Stable machine-readable code returned alongside the HTTP error.
    pub fn code(&self) -> &'static str {
        match self {
            ReferralError::InvalidAmount(_) => E_BAD_AMOUNT,
            ReferralError::InsufficientBalance { .. } => E_INSUFFICIENT_BALANCE,
            ReferralError::InvalidTransition { .. } => E_INVALID_TRANSITION,
            ReferralError::NotFound(_) => E_NOT_FOUND,
            ReferralError::InvalidName => E_INVALID_NAME,
            ReferralError::InvalidTier(_) => E_INVALID_TIER,
            ReferralError::Conflict(_) => E_CONFLICT,
            ReferralError::Storage(_) => E_DB_FAILURE,
        }
    }

    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let code = self.code();
        ApiError::from(self).with_meta(meta).with_code(code)
    }
}

impl From<ReferralError> for ApiError {
    fn from(e: ReferralError) -> Self {
        match e {
            ReferralError::InvalidAmount(_)
            | ReferralError::InvalidTransition { .. }
            | ReferralError::InvalidName
            | ReferralError::InvalidTier(_) => ApiError::BadRequest(e.to_string()),
            ReferralError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ReferralError::InsufficientBalance { .. } | ReferralError::Conflict(_) => {
                ApiError::Conflict(e.to_string())
            }
            ReferralError::Storage(inner) => ApiError::Internal(inner),
        }
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(e) => {
                error!(request_id = %self.meta.request_id, "internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        let meta = RequestMeta::new();
        let cases = [
            (ReferralError::InvalidAmount("x".into()), StatusCode::BAD_REQUEST),
            (ReferralError::InvalidName, StatusCode::BAD_REQUEST),
            (
                ReferralError::InvalidTransition {
                    from: PayoutStatus::Paid,
                    to: PayoutStatus::Cancelled,
                },
                StatusCode::BAD_REQUEST,
            ),
            (ReferralError::NotFound("payout 3".into()), StatusCode::NOT_FOUND),
            (
                ReferralError::InsufficientBalance {
                    requested: Decimal::TEN,
                    available: Decimal::ONE,
                },
                StatusCode::CONFLICT,
            ),
            (
                ReferralError::Storage(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let resp = err.with_meta(meta.clone()).into_response();
            assert_eq!(resp.status(), status);
        }
    }
}
