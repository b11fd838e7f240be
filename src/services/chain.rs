use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

use crate::error::{PaywallError, VerificationError};
use crate::models::{is_tx_hash, ChainTransaction, PaymentRecord};
use crate::services::verifier::{validate_transfer, TransactionVerifier};

/// Verifies payments against a fullnode REST API. Fetches the transaction
/// document by hash and walks it through the acceptance ladder; the shape of
/// the returned JSON decides which ledger parser runs.
pub struct ChainVerifier {
    client: reqwest::Client,
    fullnode_url: String,
    lookup_cache: Cache<String, serde_json::Value>,
}

impl ChainVerifier {
    pub fn new(fullnode_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        // Committed transactions are immutable, so the TTL only bounds memory.
        let lookup_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(300))
            .build();

        tracing::info!(fullnode = fullnode_url, "Chain verifier initialized");

        Ok(Self {
            client,
            fullnode_url: fullnode_url.trim_end_matches('/').to_string(),
            lookup_cache,
        })
    }

    async fn fetch(&self, hash: &str) -> Result<serde_json::Value, PaywallError> {
        let url = format!("{}/transactions/by_hash/{}", self.fullnode_url, hash);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PaywallError::ChainUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VerificationError::NotFound.into());
        }
        if !response.status().is_success() {
            return Err(PaywallError::ChainUnavailable(format!(
                "Fullnode returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PaywallError::ChainUnavailable(e.to_string()))
    }
}

#[async_trait]
impl TransactionVerifier for ChainVerifier {
    async fn verify(
        &self,
        transaction_id: &str,
        expected_amount: u128,
        expected_recipient: &str,
    ) -> Result<PaymentRecord, PaywallError> {
        // A string that cannot be a ledger hash will never resolve; reject it
        // without burning a fullnode round trip.
        if !is_tx_hash(transaction_id) {
            return Err(VerificationError::FormatError.into());
        }

        let tx = match self.lookup_cache.get(transaction_id).await {
            Some(doc) => {
                tracing::debug!(hash = transaction_id, "Transaction cache hit");
                ChainTransaction::detect(&doc).map_err(|_| VerificationError::FormatError)?
            }
            None => {
                let doc = self.fetch(transaction_id).await?;
                let tx = ChainTransaction::detect(&doc)
                    .map_err(|_| VerificationError::FormatError)?;
                // Only recognizable documents are cached; a pending lookup
                // must stay fresh until the transaction commits.
                self.lookup_cache
                    .insert(transaction_id.to_string(), doc)
                    .await;
                tx
            }
        };

        let amount = validate_transfer(&tx, expected_recipient, expected_amount)?;

        tracing::info!(
            hash = %tx.hash(),
            amount = amount as u64,
            payer = %tx.payer(),
            format = ?tx.format(),
            "Chain transaction verified"
        );

        Ok(PaymentRecord::verified(tx.hash(), amount, tx.payer()))
    }

    async fn ping(&self) -> bool {
        match self.client.get(&self.fullnode_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn mode(&self) -> &'static str {
        "chain"
    }
}
