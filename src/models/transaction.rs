use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which on-chain shape a transaction uses. The wire format carries no tag;
/// the shape is resolved structurally via [`ChainTransaction::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerFormat {
    /// EVM-style: `to`/`from`/`value` plus a `status` string.
    Evm,
    /// Move-style: `sender` plus an entry-function `payload` and a `success` flag.
    Move,
}

impl LedgerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Move => "move",
        }
    }
}

/// EVM-shaped transaction (Movement EVM endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmTransaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    /// Transferred amount, hex-encoded with `0x` prefix.
    pub value: String,
    /// `"success"` or `"failure"`.
    pub status: String,
    pub gas_used: String,
    pub nonce: u64,
    pub block_number: u64,
}

/// Move-shaped transaction (Aptos-style fullnode REST).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTransaction {
    pub hash: String,
    pub sender: String,
    pub success: bool,
    pub payload: EntryFunctionPayload,
    /// Fullnode REST encodes u64 fields as decimal strings.
    pub sequence_number: String,
    pub gas_used: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFunctionPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub function: String,
    /// `[recipient, amount]` for a transfer call.
    pub arguments: Vec<String>,
    #[serde(default)]
    pub type_arguments: Vec<String>,
}

/// Raised when a transaction body matches neither supported shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Unrecognized transaction format")]
pub struct UnrecognizedFormat;

/// A transaction in exactly one of the two supported ledger shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChainTransaction {
    Evm(EvmTransaction),
    Move(MoveTransaction),
}

impl ChainTransaction {
    /// Structurally detect the transaction shape from raw JSON.
    ///
    /// Probes for `status` + `to` (EVM) or `success` + `payload` (Move).
    /// Anything else is reported as [`UnrecognizedFormat`], never guessed at
    /// and never a panic.
    pub fn detect(value: &serde_json::Value) -> Result<Self, UnrecognizedFormat> {
        let obj = value.as_object().ok_or(UnrecognizedFormat)?;

        if obj.contains_key("status") && obj.contains_key("to") {
            serde_json::from_value(value.clone())
                .map(Self::Evm)
                .map_err(|_| UnrecognizedFormat)
        } else if obj.contains_key("success") && obj.contains_key("payload") {
            serde_json::from_value(value.clone())
                .map(Self::Move)
                .map_err(|_| UnrecognizedFormat)
        } else {
            Err(UnrecognizedFormat)
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Self::Evm(tx) => &tx.hash,
            Self::Move(tx) => &tx.hash,
        }
    }

    /// Whether the transaction executed successfully on-chain.
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Evm(tx) => tx.status == "success",
            Self::Move(tx) => tx.success,
        }
    }

    /// The paying address (`from` for EVM, `sender` for Move).
    pub fn payer(&self) -> &str {
        match self {
            Self::Evm(tx) => &tx.from,
            Self::Move(tx) => &tx.sender,
        }
    }

    pub fn format(&self) -> LedgerFormat {
        match self {
            Self::Evm(_) => LedgerFormat::Evm,
            Self::Move(_) => LedgerFormat::Move,
        }
    }
}

/// Parse an on-chain amount field: hex when `0x`-prefixed, decimal otherwise.
pub fn parse_amount(raw: &str) -> Option<u128> {
    let raw = raw.trim();
    if let Some(hex_digits) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u128::from_str_radix(hex_digits, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// True when `s` looks like a 32-byte transaction hash (`0x` + 64 hex chars).
pub fn is_tx_hash(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && hex::decode(&s[2..]).is_ok()
}
