use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{PaywallError, VerificationError};
use crate::models::{ChainTransaction, LedgerFormat, PaymentRecord};
use crate::services::verifier::{validate_transfer, TransactionVerifier};

const LCG_MUL: u64 = 6364136223846793005;
const LCG_INC: u64 = 1442695040888963407;
const GOLDEN_GAMMA: u64 = 0x9e3779b97f4a7c15;
const DEFAULT_SUCCESS_RATE: f64 = 0.9;

/// Offline stand-in for the chain verifier. Synthesizes transactions on
/// demand and verifies them through the same acceptance ladder the real
/// lookup uses. Owns no HTTP client and performs no I/O in any operation.
///
/// All randomness comes from two seeded counters: the outcome stream decides
/// success or failure, the material stream supplies hashes, addresses and
/// aux fields. Every `generate` call consumes a fixed number of draws from
/// each, so the n-th generated transaction is a pure function of the seed,
/// n, and the call's parameters. Two instances with the same seed produce
/// byte-identical documents.
pub struct SimulatedVerifier {
    success_rate: f64,
    state: Mutex<SimState>,
}

struct SimState {
    outcome: u64,
    material: u64,
    ledger: HashMap<String, serde_json::Value>,
}

/// What [`SimulatedVerifier::generate`] handed out.
#[derive(Debug, Clone)]
pub struct GeneratedTransaction {
    pub hash: String,
    pub format: LedgerFormat,
    pub succeeded: bool,
}

impl SimulatedVerifier {
    pub fn new(seed: &str, success_rate: f64) -> Self {
        let success_rate = if success_rate.is_finite() {
            success_rate.clamp(0.0, 1.0)
        } else {
            DEFAULT_SUCCESS_RATE
        };

        let base = fnv1a(seed);

        tracing::info!(
            seed = seed,
            success_rate = success_rate,
            "Simulated verifier initialized"
        );

        Self {
            success_rate,
            state: Mutex::new(SimState {
                outcome: base,
                material: base ^ GOLDEN_GAMMA,
                ledger: HashMap::new(),
            }),
        }
    }

    /// Synthesizes one transaction in the requested ledger format, records
    /// it in the in-memory ledger for later lookup, and returns its hash.
    /// The document succeeds with the configured probability.
    pub fn generate(
        &self,
        format: LedgerFormat,
        recipient: &str,
        amount: u128,
    ) -> GeneratedTransaction {
        let mut state = self.lock();

        let succeeded = unit(step(&mut state.outcome)) < self.success_rate;

        let hash = format!("0x{}", hex64(&mut state.material));
        let payer_hex = hex64(&mut state.material);
        let recipient = recipient.to_lowercase();

        let doc = match format {
            LedgerFormat::Evm => {
                let gas_used = 21_000 + step(&mut state.material) % 40_000;
                let nonce = step(&mut state.material) % 1_000;
                let block_number = 8_000_000 + step(&mut state.material) % 1_000_000;
                serde_json::json!({
                    "hash": hash,
                    "from": format!("0x{}", &payer_hex[..40]),
                    "to": recipient,
                    "value": format!("{:#x}", amount),
                    "status": if succeeded { "success" } else { "failure" },
                    "gasUsed": format!("{:#x}", gas_used),
                    "nonce": nonce,
                    "blockNumber": block_number,
                })
            }
            LedgerFormat::Move => {
                let sequence_number = step(&mut state.material) % 500;
                let gas_used = step(&mut state.material) % 2_000;
                let version = 1_000_000 + step(&mut state.material) % 9_000_000;
                serde_json::json!({
                    "hash": hash,
                    "sender": format!("0x{}", payer_hex),
                    "success": succeeded,
                    "payload": {
                        "type": "entry_function_payload",
                        "function": "0x1::aptos_account::transfer",
                        "arguments": [recipient, amount.to_string()],
                        "type_arguments": ["0x1::aptos_coin::AptosCoin"],
                    },
                    "sequence_number": sequence_number.to_string(),
                    "gas_used": gas_used.to_string(),
                    "version": version.to_string(),
                })
            }
        };

        state.ledger.insert(hash.clone(), doc);

        tracing::debug!(
            hash = %hash,
            format = ?format,
            succeeded = succeeded,
            "Generated simulated transaction"
        );

        GeneratedTransaction {
            hash,
            format,
            succeeded,
        }
    }

    /// Raw ledger document, if this verifier generated the hash.
    pub fn transaction(&self, hash: &str) -> Option<serde_json::Value> {
        self.lock().ledger.get(hash).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TransactionVerifier for SimulatedVerifier {
    async fn verify(
        &self,
        transaction_id: &str,
        expected_amount: u128,
        expected_recipient: &str,
    ) -> Result<PaymentRecord, PaywallError> {
        let doc = self.lock().ledger.get(transaction_id).cloned();

        let doc = doc.ok_or(VerificationError::NotFound)?;
        let tx = ChainTransaction::detect(&doc).map_err(|_| VerificationError::FormatError)?;
        let amount = validate_transfer(&tx, expected_recipient, expected_amount)?;

        tracing::info!(
            hash = %tx.hash(),
            amount = amount as u64,
            payer = %tx.payer(),
            "Simulated transaction verified"
        );

        Ok(PaymentRecord::verified(tx.hash(), amount, tx.payer()))
    }

    async fn ping(&self) -> bool {
        true
    }

    fn mode(&self) -> &'static str {
        "simulated"
    }
}

fn fnv1a(data: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn step(counter: &mut u64) -> u64 {
    *counter = counter.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
    *counter
}

/// Uniform draw in [0, 1) from the top 53 bits.
fn unit(raw: u64) -> f64 {
    (raw >> 11) as f64 / (1u64 << 53) as f64
}

fn hex64(counter: &mut u64) -> String {
    let mut out = String::with_capacity(64);
    for _ in 0..4 {
        out.push_str(&format!("{:016x}", step(counter)));
    }
    out
}
