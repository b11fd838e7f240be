use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Closed reason taxonomy for transaction verification. These cross the
/// verify boundary as values, never as panics: a malformed or missing
/// transaction produces a reason, not an exception.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Transaction not found on chain")]
    NotFound,

    #[error("Transaction failed on-chain")]
    TransactionFailed,

    #[error("Transaction is not a recognized transfer")]
    InvalidTransfer,

    #[error("Payment sent to wrong recipient: {actual}")]
    WrongRecipient { actual: String },

    #[error("Insufficient payment: sent {sent} octas, required {required} octas")]
    InsufficientPayment { sent: u128, required: u128 },

    #[error("Unrecognized transaction format")]
    FormatError,
}

impl VerificationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::TransactionFailed => "TRANSACTION_FAILED",
            Self::InvalidTransfer => "INVALID_TRANSFER",
            Self::WrongRecipient { .. } => "WRONG_RECIPIENT",
            Self::InsufficientPayment { .. } => "INSUFFICIENT_PAYMENT",
            Self::FormatError => "FORMAT_ERROR",
        }
    }
}

#[derive(Error, Debug)]
pub enum PaywallError {
    #[error("{0}")]
    Verification(#[from] VerificationError),

    #[error("Transaction has already been used for a whitelist grant: {0}")]
    DuplicateTransaction(String),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Whitelist provider failure: {0}")]
    Provider(String),

    #[error("Chain lookup unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Shutdown already in progress")]
    ShutdownInProgress,

    #[error("Service is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaywallError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Verification(reason) => reason.code(),
            Self::DuplicateTransaction(_) => "DUPLICATE_TRANSACTION",
            Self::InvalidIp(_) => "INVALID_IP",
            Self::Persistence(_) => "PERSISTENCE_FAILURE",
            Self::Provider(_) => "PROVIDER_FAILURE",
            Self::ChainUnavailable(_) => "CHAIN_UNAVAILABLE",
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS",
            Self::NotRunning => "NOT_RUNNING",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,

    /// x402 payment requirements, attached to 402 responses so callers know
    /// how to clear the paywall.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepts: Option<Vec<PaymentRequirements>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentRequirements {
    #[serde(rename = "payTo")]
    pub pay_to: String,
    #[serde(rename = "maxAmountRequired")]
    pub max_amount_required: String,
    pub currency: String,
    pub network: String,
}

impl IntoResponse for PaywallError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();

        let (status, accepts) = match &self {
            PaywallError::Verification(_) => {
                (StatusCode::PAYMENT_REQUIRED, Some(payment_requirements()))
            }
            PaywallError::DuplicateTransaction(_) => (StatusCode::CONFLICT, None),
            PaywallError::InvalidIp(_) | PaywallError::ConfigInvalid(_) => {
                (StatusCode::BAD_REQUEST, None)
            }
            PaywallError::Provider(_) | PaywallError::ChainUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, None)
            }
            PaywallError::ShutdownInProgress | PaywallError::NotRunning => {
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
            PaywallError::Persistence(_) | PaywallError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let error_code = self.code();
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
            request_id,
            accepts,
        };

        tracing::error!(
            error = ?self,
            error_code = error_code,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

fn payment_requirements() -> Vec<PaymentRequirements> {
    // Read from the environment so the error path stays state-free.
    let pay_to = std::env::var("PAYMENT_ADDRESS").unwrap_or_else(|_| {
        "0x0000000000000000000000000000000000000000000000000000000000000000".to_string()
    });
    let amount = std::env::var("PAYMENT_AMOUNT_OCTAS").unwrap_or_else(|_| "1000000".to_string());
    let network = std::env::var("CHAIN_NETWORK").unwrap_or_else(|_| "movement-testnet".to_string());

    vec![PaymentRequirements {
        pay_to,
        max_amount_required: amount,
        currency: "MOVE".to_string(),
        network,
    }]
}
