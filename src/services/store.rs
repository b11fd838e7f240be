use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::PaywallError;
use crate::models::{PaymentRecord, StoreSnapshot, WhitelistEntry};

const ENTRY_KEY_PREFIX: &str = "botpaywall:whitelist:";
const USED_HASHES_KEY: &str = "botpaywall:used_hashes";

/// Authoritative record of whitelist entries and spent transaction hashes.
/// The in-memory maps are the source of truth; Redis (when attached) is a
/// best-effort mirror for operators, and an optional JSON snapshot file
/// carries state across restarts.
///
/// Entries are keyed by canonical IP, one row per address: a renewed grant
/// replaces the row, and expiry marks the row rather than deleting it. The
/// reconciliation sweep is what actually drains lapsed rows.
///
/// A mirror failure is logged and counted but never fails the write. A
/// snapshot write failure does: callers must not report a grant that would
/// not survive a restart.
pub struct WhitelistStore {
    state: RwLock<StoreState>,
    redis: Option<redis::aio::ConnectionManager>,
    snapshot_path: Option<PathBuf>,
    mirror_failures: AtomicU64,
}

struct StoreState {
    entries: HashMap<String, WhitelistEntry>,
    used_hashes: HashSet<String>,
}

impl WhitelistStore {
    pub async fn new(redis_url: Option<&str>, snapshot_path: Option<PathBuf>) -> Result<Self> {
        let redis = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(conn) => {
                        tracing::info!("Redis mirror connected");
                        Some(conn)
                    }
                    Err(e) => {
                        tracing::warn!("Redis connection failed: {}, mirror disabled", e);
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!("Redis client creation failed: {}, mirror disabled", e);
                    None
                }
            },
            None => None,
        };

        let snapshot = Self::load_snapshot(snapshot_path.as_ref()).await?;
        let entries: HashMap<String, WhitelistEntry> = snapshot
            .entries
            .into_iter()
            .map(|entry| (entry.ip_address.clone(), entry))
            .collect();

        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Loaded whitelist snapshot");
        }

        Ok(Self {
            state: RwLock::new(StoreState {
                entries,
                used_hashes: snapshot.used_hashes.into_iter().collect(),
            }),
            redis,
            snapshot_path,
            mirror_failures: AtomicU64::new(0),
        })
    }

    async fn load_snapshot(path: Option<&PathBuf>) -> Result<StoreSnapshot> {
        let Some(path) = path else {
            return Ok(StoreSnapshot::default());
        };

        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt whitelist snapshot at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreSnapshot::default()),
            Err(e) => {
                Err(e).with_context(|| format!("Cannot read snapshot at {}", path.display()))
            }
        }
    }

    /// Creates the row for a freshly verified payment, replacing any prior
    /// row for the same IP, and returns it.
    pub async fn add_entry(
        &self,
        ip: &str,
        payment: &PaymentRecord,
    ) -> Result<WhitelistEntry, PaywallError> {
        let entry = WhitelistEntry::from_payment(ip, payment);
        let snapshot = {
            let mut state = self.state.write().await;
            state
                .entries
                .insert(entry.ip_address.clone(), entry.clone());
            state.snapshot()
        };

        self.mirror_entry(&entry).await;
        self.flush(&snapshot).await?;
        Ok(entry)
    }

    /// Rewrites an existing row in place, matched by id. Updating an id the
    /// store has never seen is a persistence failure, not a silent no-op.
    pub async fn update(&self, entry: WhitelistEntry) -> Result<(), PaywallError> {
        let snapshot = {
            let mut state = self.state.write().await;
            let known = state
                .entries
                .values()
                .any(|existing| existing.id == entry.id);
            if !known {
                return Err(PaywallError::Persistence(format!(
                    "No whitelist entry with id {}",
                    entry.id
                )));
            }
            state
                .entries
                .insert(entry.ip_address.clone(), entry.clone());
            state.snapshot()
        };

        self.mirror_entry(&entry).await;
        self.flush(&snapshot).await
    }

    /// Appends the expiry marker to the row's reason and bumps `updated_at`.
    /// The row stays in the store as an audit record until a sweep or a
    /// renewed grant displaces it.
    pub async fn mark_expired(
        &self,
        entry_id: &str,
        at: DateTime<Utc>,
    ) -> Result<WhitelistEntry, PaywallError> {
        let (entry, snapshot) = {
            let mut state = self.state.write().await;
            let Some(entry) = state
                .entries
                .values_mut()
                .find(|entry| entry.id == entry_id)
            else {
                return Err(PaywallError::Persistence(format!(
                    "No whitelist entry with id {}",
                    entry_id
                )));
            };
            entry.mark_expired(at);
            let entry = entry.clone();
            (entry, state.snapshot())
        };

        self.mirror_entry(&entry).await;
        self.flush(&snapshot).await?;
        Ok(entry)
    }

    pub async fn get(&self, ip: &str) -> Option<WhitelistEntry> {
        self.state.read().await.entries.get(ip).cloned()
    }

    pub async fn exists(&self, ip: &str) -> bool {
        self.state.read().await.entries.contains_key(ip)
    }

    /// Every row, newest grant first.
    pub async fn list_all(&self) -> Vec<WhitelistEntry> {
        let mut entries: Vec<WhitelistEntry> =
            self.state.read().await.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    pub async fn active_count(&self) -> u64 {
        self.state.read().await.entries.len() as u64
    }

    /// Drains every row created at or before the cutoff. The scheduler
    /// passes `now − ttl`; this is the timer-independent sweep that recovers
    /// entries whose timers died with a previous process.
    pub async fn remove_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WhitelistEntry>, PaywallError> {
        let (removed, snapshot) = {
            let mut state = self.state.write().await;
            let lapsed: Vec<String> = state
                .entries
                .values()
                .filter(|entry| entry.created_at <= cutoff)
                .map(|entry| entry.ip_address.clone())
                .collect();
            let removed: Vec<WhitelistEntry> = lapsed
                .iter()
                .filter_map(|ip| state.entries.remove(ip))
                .collect();
            (removed, state.snapshot())
        };

        if !removed.is_empty() {
            for entry in &removed {
                self.mirror_remove(&entry.ip_address).await;
            }
            self.flush(&snapshot).await?;
        }
        Ok(removed)
    }

    /// Records a transaction hash as spent. Consulted before verification so
    /// one payment cannot buy two grants.
    pub async fn mark_used(&self, hash: &str) -> Result<(), PaywallError> {
        let snapshot = {
            let mut state = self.state.write().await;
            state.used_hashes.insert(hash.to_string());
            state.snapshot()
        };

        if let Some(mut redis) = self.redis.clone() {
            if let Err(e) = redis.sadd::<_, _, ()>(USED_HASHES_KEY, hash).await {
                tracing::warn!("Redis mirror sadd error: {}", e);
                self.mirror_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.flush(&snapshot).await
    }

    pub async fn is_used(&self, hash: &str) -> bool {
        self.state.read().await.used_hashes.contains(hash)
    }

    pub fn mirror_failures(&self) -> u64 {
        self.mirror_failures.load(Ordering::Relaxed)
    }

    pub async fn ping(&self) -> bool {
        match self.redis.clone() {
            Some(mut redis) => {
                match redis::cmd("PING").query_async::<_, String>(&mut redis).await {
                    Ok(_) => true,
                    Err(_) => false,
                }
            }
            // Memory-only deployments are healthy by definition.
            None => true,
        }
    }

    /// Final flush before shutdown.
    pub async fn close(&self) -> Result<(), PaywallError> {
        let snapshot = self.state.read().await.snapshot();
        self.flush(&snapshot).await?;
        tracing::info!("Whitelist store closed");
        Ok(())
    }

    async fn mirror_entry(&self, entry: &WhitelistEntry) {
        let Some(mut redis) = self.redis.clone() else {
            return;
        };
        let key = format!("{}{}", ENTRY_KEY_PREFIX, entry.ip_address);
        match serde_json::to_string(entry) {
            Ok(serialized) => {
                if let Err(e) = redis.set::<_, _, ()>(&key, serialized).await {
                    tracing::warn!("Redis mirror set error: {}", e);
                    self.mirror_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::warn!("Mirror serialization error: {}", e);
                self.mirror_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn mirror_remove(&self, ip: &str) {
        let Some(mut redis) = self.redis.clone() else {
            return;
        };
        let key = format!("{}{}", ENTRY_KEY_PREFIX, ip);
        if let Err(e) = redis.del::<_, ()>(&key).await {
            tracing::warn!("Redis mirror del error: {}", e);
            self.mirror_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn flush(&self, snapshot: &StoreSnapshot) -> Result<(), PaywallError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let serialized = serde_json::to_string_pretty(snapshot)
            .map_err(|e| PaywallError::Persistence(e.to_string()))?;
        tokio::fs::write(path, serialized)
            .await
            .map_err(|e| PaywallError::Persistence(format!("{}: {}", path.display(), e)))
    }
}

impl StoreState {
    // Sorted so the snapshot file is byte-stable across flushes.
    fn snapshot(&self) -> StoreSnapshot {
        let mut entries: Vec<WhitelistEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        let mut used_hashes: Vec<String> = self.used_hashes.iter().cloned().collect();
        used_hashes.sort();
        StoreSnapshot {
            entries,
            used_hashes,
        }
    }
}
