use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};

use crate::models::{
    MonitorStats, PaymentClaim, PaymentInfo, SimulateRequest, SimulateResponse, SystemStatus,
    VerifyRequest, VerifyResponse,
};

/// HTTP client for the paywall API, used by the test agent and by scraper
/// SDKs driving the payment flow.
pub struct PaywallClient {
    http: reqwest::Client,
    base_url: String,
}

impl PaywallClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("HTTP client construction failed")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn payment_info(&self) -> Result<PaymentInfo> {
        let response = self
            .http
            .get(format!("{}/payment-info", self.base_url))
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Mints a simulated transaction (development servers only).
    pub async fn simulate_payment(
        &self,
        recipient: Option<&str>,
        amount: Option<u128>,
    ) -> Result<SimulateResponse> {
        let body = SimulateRequest {
            recipient: recipient.map(str::to_string),
            amount,
        };
        let response = self
            .http
            .post(format!("{}/api/x402-payment/simulate", self.base_url))
            .json(&body)
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Synchronous grant: runs the full pipeline and returns the entry.
    pub async fn verify_payment(
        &self,
        transaction_id: &str,
        client_ip: &str,
    ) -> Result<VerifyResponse> {
        let body = VerifyRequest {
            transaction_id: transaction_id.to_string(),
            client_ip: client_ip.to_string(),
            expected_amount: None,
            expected_currency: None,
        };
        let response = self
            .http
            .post(format!("{}/api/x402-payment/verify", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Verification rejected ({}): {}", status, text);
        }
        Ok(response.json().await?)
    }

    /// Fire-and-forget claim into the monitoring feed. The grant happens
    /// asynchronously; pair with `wait_for_whitelist`.
    pub async fn submit_claim(&self, transaction_id: &str, client_ip: &str) -> Result<()> {
        let claim = PaymentClaim {
            transaction_id: transaction_id.to_string(),
            client_ip: client_ip.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/api/monitor/event", self.base_url))
            .json(&claim)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::ACCEPTED {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("Claim not accepted ({}): {}", status, text);
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Polls the status API until the grant counter moves past `baseline`,
    /// backing off from 100ms up to 2s. Bails early if the failure counter
    /// moves instead: the claim was rejected and waiting longer cannot help.
    pub async fn wait_for_whitelist(
        &self,
        baseline: &MonitorStats,
        timeout: Duration,
    ) -> Result<SystemStatus> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(100);

        loop {
            let status = self.status().await?;
            if status.monitoring.grants_issued > baseline.grants_issued {
                return Ok(status);
            }
            if status.monitoring.failures > baseline.failures {
                bail!("Payment claim was rejected");
            }
            if Instant::now() >= deadline {
                bail!("Timed out waiting for a whitelist grant");
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }
}

/// Client-side view of the current grant: when it was issued and whether the
/// agent should start a fresh payment flow.
pub struct AccessState {
    ttl: Duration,
    last_grant_at: Option<Instant>,
}

impl AccessState {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_grant_at: None,
        }
    }

    pub fn record_grant(&mut self) {
        self.last_grant_at = Some(Instant::now());
    }

    /// True when no grant was ever recorded or the last one ran out its TTL.
    pub fn is_grant_expired(&self) -> bool {
        match self.last_grant_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// A paywalled edge response together with a lapsed grant means pay
    /// again. A 402/403 while the grant should still be live is treated as a
    /// propagation hiccup to retry, not a reason to spend.
    pub fn should_renew(&self, status: u16) -> bool {
        (status == 402 || status == 403) && self.is_grant_expired()
    }
}
