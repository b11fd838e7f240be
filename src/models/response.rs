use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request body of the manual payment trigger
/// (`POST /api/x402-payment/verify`). Field names match the original wire
/// format consumed by the scraper SDK.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub transaction_id: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    /// Optional override in octas; must equal the configured price.
    pub expected_amount: Option<u128>,
    /// Optional override; must equal the configured currency.
    pub expected_currency: Option<String>,
}

/// Successful outcome of the grant pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub verified: bool,
    pub entry_id: String,
    pub rule_id: String,
    pub ip: String,
    pub reason: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Payment instructions served to clients that hit the paywall. Snake case on
/// the wire: the SDK reads `client_ip` and `payment_address` verbatim.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentInfo {
    pub payment_address: String,
    /// Price in octas.
    pub payment_amount: u128,
    pub payment_currency: String,
    pub network: String,
    pub whitelist_duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

/// Request body of the development-only transaction simulator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    pub recipient: Option<String>,
    pub amount: Option<u128>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    pub transaction_hash: String,
    pub format: String,
}

/// Monitoring pipeline counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MonitorStats {
    pub claims_seen: u64,
    pub grants_issued: u64,
    pub failures: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub source_connected: bool,
}

/// Cleanup scheduler counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CleanupStats {
    pub active_timers: u64,
    pub scheduled_total: u64,
    pub expired_total: u64,
    pub cancelled_total: u64,
    pub reconciled_total: u64,
    pub provider_failures: u64,
}

/// Coarse log counters surfaced through the status API.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LogStats {
    pub events: u64,
    pub warnings: u64,
    pub errors: u64,
}

/// Full system status (`GET /status`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemStatus {
    pub is_running: bool,
    pub state: String,
    pub uptime_seconds: u64,
    pub monitoring: MonitorStats,
    pub cleanup: CleanupStats,
    pub log_stats: LogStats,
    pub database_connected: bool,
    pub cloudflare_connected: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub database: bool,
    pub firewall: bool,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}
