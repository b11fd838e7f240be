use async_trait::async_trait;

use crate::error::{PaywallError, VerificationError};
use crate::models::{parse_amount, ChainTransaction, PaymentRecord};

/// A backend that can answer "did this transaction pay us?".
///
/// Implementations return a verified [`PaymentRecord`] on acceptance. Every
/// rejection reason travels as a [`VerificationError`] value wrapped in
/// [`PaywallError::Verification`]; transport trouble is reported separately
/// as [`PaywallError::ChainUnavailable`] so callers can tell "you did not
/// pay" apart from "we could not look". Verification is a pure read and may
/// be repeated; replay protection belongs to the caller's used-hash set.
#[async_trait]
pub trait TransactionVerifier: Send + Sync {
    async fn verify(
        &self,
        transaction_id: &str,
        expected_amount: u128,
        expected_recipient: &str,
    ) -> Result<PaymentRecord, PaywallError>;

    /// Cheap reachability probe for health reporting.
    async fn ping(&self) -> bool;

    fn mode(&self) -> &'static str;
}

/// Walks the acceptance ladder over an already-fetched transaction and
/// returns the paid amount in octas. The first failing rung wins; later
/// rungs are not evaluated, so an overpaying transfer to the wrong address
/// still reports the recipient problem.
pub fn validate_transfer(
    tx: &ChainTransaction,
    expected_recipient: &str,
    required_octas: u128,
) -> Result<u128, VerificationError> {
    if !tx.succeeded() {
        return Err(VerificationError::TransactionFailed);
    }

    let (recipient, raw_amount) = match tx {
        ChainTransaction::Evm(evm) => {
            if evm.to.is_empty() {
                return Err(VerificationError::InvalidTransfer);
            }
            (evm.to.as_str(), evm.value.as_str())
        }
        ChainTransaction::Move(mv) => {
            if mv.payload.payload_type != "entry_function_payload"
                || !is_transfer_function(&mv.payload.function)
                || mv.payload.arguments.len() != 2
            {
                return Err(VerificationError::InvalidTransfer);
            }
            (
                mv.payload.arguments[0].as_str(),
                mv.payload.arguments[1].as_str(),
            )
        }
    };

    let amount = parse_amount(raw_amount).ok_or(VerificationError::InvalidTransfer)?;

    if !recipient.eq_ignore_ascii_case(expected_recipient) {
        return Err(VerificationError::WrongRecipient {
            actual: recipient.to_string(),
        });
    }

    if amount < required_octas {
        return Err(VerificationError::InsufficientPayment {
            sent: amount,
            required: required_octas,
        });
    }

    Ok(amount)
}

/// Accepts the bare function name and fully qualified Move paths such as
/// `0x1::coin::transfer` or `0x1::aptos_account::transfer`.
pub fn is_transfer_function(function: &str) -> bool {
    function.rsplit("::").next() == Some("transfer")
}
