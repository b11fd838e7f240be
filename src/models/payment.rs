use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Octas per MOVE token (the smallest on-chain unit).
pub const OCTAS_PER_MOVE: u128 = 100_000_000;

/// The single currency the paywall accepts. There is no tiered pricing and
/// no multi-currency support; anything else is rejected before verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "MOVE")]
    Move,
}

impl Currency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MOVE" => Some(Self::Move),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move => write!(f, "MOVE"),
        }
    }
}

/// A verified on-chain payment. Immutable once constructed: a record only
/// exists after the transaction passed the full validation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub transaction_id: String,
    /// Actual transferred amount in octas (may exceed the configured price;
    /// overpayment is accepted).
    pub amount: u128,
    pub currency: Currency,
    pub timestamp: DateTime<Utc>,
    pub payer_address: String,
    pub verified: bool,
}

impl PaymentRecord {
    /// Build the record for a transaction that already verified.
    pub fn verified(transaction_id: &str, amount: u128, payer_address: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            amount,
            currency: Currency::Move,
            timestamp: Utc::now(),
            payer_address: payer_address.to_string(),
            verified: true,
        }
    }

    pub fn amount_move(&self) -> f64 {
        self.amount as f64 / OCTAS_PER_MOVE as f64
    }
}

/// A candidate payment event: a claimed transaction id plus the client IP
/// asking for access. Produced by the monitoring source or the manual
/// trigger API; nothing about it is trusted until verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentClaim {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_parses_case_insensitively() {
        assert_eq!(Currency::parse("MOVE"), Some(Currency::Move));
        assert_eq!(Currency::parse("move"), Some(Currency::Move));
        assert_eq!(Currency::parse(" Move "), Some(Currency::Move));
        assert_eq!(Currency::parse("USDC"), None);
        assert_eq!(Currency::parse(""), None);
    }

    #[test]
    fn payment_record_converts_octas() {
        let record = PaymentRecord::verified("0xabc", 1_000_000, "0xsender");
        assert!(record.verified);
        assert_eq!(record.currency, Currency::Move);
        assert!((record.amount_move() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn claim_uses_original_wire_keys() {
        let claim: PaymentClaim =
            serde_json::from_str(r#"{"transactionId":"0xabc","clientIP":"203.0.113.7"}"#)
                .expect("claim should parse");
        assert_eq!(claim.transaction_id, "0xabc");
        assert_eq!(claim.client_ip, "203.0.113.7");

        let json = serde_json::to_value(&claim).expect("claim should serialize");
        assert!(json.get("clientIP").is_some());
    }
}
