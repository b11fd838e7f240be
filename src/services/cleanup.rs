use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::PaywallError;
use crate::models::CleanupStats;
use crate::services::firewall::WhitelistProvider;
use crate::services::store::WhitelistStore;

/// Expires whitelist grants when their TTL lapses.
///
/// Each grant gets one timer sleeping until `created_at + ttl`. Deadlines are
/// derived from the persisted creation time, never from when the timer was
/// created, so rescheduling after a restart lands on the original expiry. On
/// firing, the store row is marked expired first and the firewall rule is
/// removed best-effort: the row is the source of truth for entitlement, the
/// rule is eventually consistent and a failed removal is left for the next
/// reconciliation sweep.
pub struct CleanupScheduler {
    store: Arc<WhitelistStore>,
    provider: Arc<dyn WhitelistProvider>,
    ttl_secs: u64,
    timers: Mutex<HashMap<String, TimerEntry>>,
    shutting_down: AtomicBool,
    scheduled_total: AtomicU64,
    expired_total: AtomicU64,
    cancelled_total: AtomicU64,
    reconciled_total: AtomicU64,
    provider_failures: AtomicU64,
}

struct TimerEntry {
    ip: String,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<WhitelistStore>,
        provider: Arc<dyn WhitelistProvider>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            provider,
            ttl_secs,
            timers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            scheduled_total: AtomicU64::new(0),
            expired_total: AtomicU64::new(0),
            cancelled_total: AtomicU64::new(0),
            reconciled_total: AtomicU64::new(0),
            provider_failures: AtomicU64::new(0),
        }
    }

    /// Schedules expiry for one grant. An already-elapsed deadline fires
    /// immediately; a pending timer for the same IP is replaced, so a renewed
    /// grant restarts the clock. `rule_id` is `None` when the timer is
    /// recreated after a restart and the rule has to be looked up by IP.
    pub async fn schedule(
        self: &Arc<Self>,
        entry_id: &str,
        ip: &str,
        rule_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<(), PaywallError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PaywallError::ShutdownInProgress);
        }

        let deadline = created_at + chrono::Duration::seconds(self.ttl_secs as i64);
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let mut timers = self.timers.lock().await;
        let stale_id = timers
            .iter()
            .find(|(_, timer)| timer.ip == ip)
            .map(|(id, _)| id.clone());
        if let Some(stale_id) = stale_id {
            if let Some(stale) = timers.remove(&stale_id) {
                stale.handle.abort();
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(entry_id = %stale_id, ip = ip, "Replaced pending cleanup timer");
            }
        }

        let scheduler = Arc::clone(self);
        let task_entry_id = entry_id.to_string();
        let task_ip = ip.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            scheduler.fire(task_entry_id, task_ip, rule_id).await;
        });

        timers.insert(
            entry_id.to_string(),
            TimerEntry {
                ip: ip.to_string(),
                handle,
            },
        );
        self.scheduled_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            entry_id = entry_id,
            ip = ip,
            in_secs = remaining.as_secs(),
            "Cleanup timer scheduled"
        );
        Ok(())
    }

    async fn fire(&self, entry_id: String, ip: String, rule_id: Option<String>) {
        if let Err(e) = self.store.mark_expired(&entry_id, Utc::now()).await {
            tracing::warn!(entry_id = %entry_id, "Could not mark entry expired: {}", e);
        }

        let rule = match rule_id {
            Some(rule) => Some(rule),
            None => match self.provider.find_rule(&ip).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(ip = %ip, "Rule lookup failed during expiry: {}", e);
                    self.provider_failures.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
        };

        if let Some(rule) = rule {
            if let Err(e) = self.provider.revoke(&rule).await {
                tracing::warn!(
                    ip = %ip,
                    rule_id = %rule,
                    "Rule removal failed, leaving it for the sweep: {}",
                    e
                );
                self.provider_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.timers.lock().await.remove(&entry_id);
        self.expired_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(entry_id = %entry_id, ip = %ip, "Whitelist entry expired");
    }

    /// Aborts every pending timer and returns the entry ids that were still
    /// waiting. Once called, `schedule` refuses new timers.
    pub async fn cancel_pending(&self) -> Vec<String> {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<(String, TimerEntry)> =
            self.timers.lock().await.drain().collect();

        let mut ids = Vec::with_capacity(drained.len());
        let mut handles = Vec::with_capacity(drained.len());
        for (entry_id, timer) in drained {
            timer.handle.abort();
            tracing::info!(entry_id = %entry_id, ip = %timer.ip, "Cleanup timer cancelled");
            ids.push(entry_id);
            handles.push(timer.handle);
        }

        // Let the aborted tasks settle so none outlives shutdown.
        let _ = futures::future::join_all(handles).await;

        self.cancelled_total
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        ids
    }

    /// True once `cancel_pending` has run. A shut-down scheduler accepts no
    /// more timers for the rest of the process lifetime.
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Timer-independent sweep: drains every row whose grant lapsed before
    /// `now`, removing its firewall rule best-effort. Run at startup, before
    /// any timer is accepted, to recover entries whose timers died with a
    /// previous process.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<usize, PaywallError> {
        let cutoff = now - chrono::Duration::seconds(self.ttl_secs as i64);
        let removed = self.store.remove_expired_before(cutoff).await?;

        if removed.is_empty() {
            return Ok(0);
        }

        {
            let mut timers = self.timers.lock().await;
            for entry in &removed {
                if let Some(stale) = timers.remove(&entry.id) {
                    stale.handle.abort();
                }
            }
        }

        for entry in &removed {
            match self.provider.find_rule(&entry.ip_address).await {
                Ok(Some(rule)) => {
                    if let Err(e) = self.provider.revoke(&rule).await {
                        tracing::warn!(
                            ip = %entry.ip_address,
                            rule_id = %rule,
                            "Sweep could not remove rule: {}",
                            e
                        );
                        self.provider_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(ip = %entry.ip_address, "Sweep rule lookup failed: {}", e);
                    self.provider_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.reconciled_total
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::info!(count = removed.len(), "Reconciliation sweep removed stale entries");
        Ok(removed.len())
    }

    pub async fn stats(&self) -> CleanupStats {
        CleanupStats {
            active_timers: self.timers.lock().await.len() as u64,
            scheduled_total: self.scheduled_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            reconciled_total: self.reconciled_total.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
        }
    }
}
