use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PaymentRecord;

/// One granted access window, owned exclusively by the whitelist store.
///
/// The firewall rule provisioned for the same IP is a separate external
/// resource correlated only by address. The two can drift (rule without row,
/// row without rule) and every consumer has to tolerate that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    /// Store-assigned opaque id.
    pub id: String,
    /// Canonical dotted-quad address.
    pub ip_address: String,
    /// Audit trail carrying the originating transaction id and amount; the
    /// expiry marker is appended when the grant lapses. There is no separate
    /// foreign key back to the payment.
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WhitelistEntry {
    pub fn from_payment(ip: &str, payment: &PaymentRecord) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            ip_address: ip.to_string(),
            reason: format!(
                "Payment verified: {} ({} {})",
                payment.transaction_id, payment.amount, payment.currency
            ),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the grant has lapsed. Re-derived from `created_at` so the
    /// answer survives a restart that lost the in-process timers.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now >= self.created_at + ttl
    }

    /// Append the expiry marker to the reason and bump `updated_at`.
    pub fn mark_expired(&mut self, at: DateTime<Utc>) {
        self.reason = format!("{} - Expired at {}", self.reason, at.to_rfc3339());
        self.updated_at = at;
    }
}

/// Serializable image of the whitelist store: entries plus the consumed
/// transaction hashes that back replay protection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entries: Vec<WhitelistEntry>,
    pub used_hashes: Vec<String>,
}
