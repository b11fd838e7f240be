use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::Config;
use crate::error::PaywallError;
use crate::models::{MonitorStats, PaymentClaim, WhitelistEntry};
use crate::services::cleanup::CleanupScheduler;
use crate::services::firewall::{validate_ip, WhitelistProvider};
use crate::services::store::WhitelistStore;
use crate::services::verifier::TransactionVerifier;

/// Feed of candidate payment claims. The paywall does not care where claims
/// come from; webhooks, log tails and the manual API all funnel through the
/// same pipeline. `recv` returning `None` means the feed is closed for good.
#[async_trait]
pub trait MonitoringSource: Send {
    async fn recv(&mut self) -> Option<PaymentClaim>;
}

/// In-process claim feed backed by a bounded channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<PaymentClaim>,
}

/// Cloneable handle that pushes claims into a `ChannelSource`.
#[derive(Clone)]
pub struct ClaimSender {
    tx: mpsc::Sender<PaymentClaim>,
}

pub fn channel_source(capacity: usize) -> (ClaimSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (ClaimSender { tx }, ChannelSource { rx })
}

impl ClaimSender {
    pub async fn send(&self, claim: PaymentClaim) -> Result<(), PaywallError> {
        self.tx.send(claim).await.map_err(|_| PaywallError::NotRunning)
    }
}

#[async_trait]
impl MonitoringSource for ChannelSource {
    async fn recv(&mut self) -> Option<PaymentClaim> {
        self.rx.recv().await
    }
}

/// A completed grant: the persisted row plus the firewall rule covering it.
#[derive(Debug, Clone)]
pub struct Grant {
    pub entry: WhitelistEntry,
    pub rule_id: String,
}

/// Drives the verify-then-whitelist pipeline for every incoming claim.
///
/// Stage order matters: the used-hash set is consulted before any chain
/// lookup so replays are cheap to reject, and the hash is only burned after
/// the full grant is in place, so a pipeline that failed halfway can be
/// retried with the same transaction. Duplicate claims with distinct
/// transactions are not deduplicated here; a second paid claim for the same
/// IP simply renews the grant.
pub struct MonitoringService {
    verifier: Arc<dyn TransactionVerifier>,
    store: Arc<WhitelistStore>,
    provider: Arc<dyn WhitelistProvider>,
    scheduler: Arc<CleanupScheduler>,
    price_octas: u128,
    recipient: String,
    allow_private: bool,
    ttl_secs: u64,
    claims_seen: AtomicU64,
    grants_issued: AtomicU64,
    failures: AtomicU64,
    last_event: RwLock<Option<chrono::DateTime<Utc>>>,
    source_connected: AtomicBool,
}

impl MonitoringService {
    pub fn new(
        verifier: Arc<dyn TransactionVerifier>,
        store: Arc<WhitelistStore>,
        provider: Arc<dyn WhitelistProvider>,
        scheduler: Arc<CleanupScheduler>,
        config: &Config,
    ) -> Self {
        Self {
            verifier,
            store,
            provider,
            scheduler,
            price_octas: config.price_octas,
            recipient: config.payment_address.clone(),
            allow_private: config.dev_mode(),
            ttl_secs: config.whitelist_duration_secs,
            claims_seen: AtomicU64::new(0),
            grants_issued: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_event: RwLock::new(None),
            source_connected: AtomicBool::new(false),
        }
    }

    /// Consumes the source until it closes or shutdown is signalled.
    pub async fn run<S: MonitoringSource>(
        self: Arc<Self>,
        mut source: S,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.source_connected.store(true, Ordering::SeqCst);
        tracing::info!("Monitoring started");

        loop {
            tokio::select! {
                claim = source.recv() => {
                    match claim {
                        Some(claim) => {
                            if let Err(e) = self.process(&claim).await {
                                tracing::warn!(
                                    tx = %claim.transaction_id,
                                    ip = %claim.client_ip,
                                    "Payment claim rejected: {}",
                                    e
                                );
                            }
                        }
                        None => {
                            tracing::info!("Monitoring source closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Monitoring stopping");
                        break;
                    }
                }
            }
        }

        self.source_connected.store(false, Ordering::SeqCst);
    }

    /// Runs one claim through the full pipeline and returns the grant.
    pub async fn process(&self, claim: &PaymentClaim) -> Result<Grant, PaywallError> {
        self.claims_seen.fetch_add(1, Ordering::Relaxed);
        *self.last_event.write().await = Some(Utc::now());

        let outcome = self.grant(claim).await;
        match &outcome {
            Ok(grant) => {
                self.grants_issued.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    tx = %claim.transaction_id,
                    ip = %grant.entry.ip_address,
                    rule_id = %grant.rule_id,
                    "Access granted"
                );
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    async fn grant(&self, claim: &PaymentClaim) -> Result<Grant, PaywallError> {
        if self.store.is_used(&claim.transaction_id).await {
            return Err(PaywallError::DuplicateTransaction(
                claim.transaction_id.clone(),
            ));
        }

        let payment = self
            .verifier
            .verify(&claim.transaction_id, self.price_octas, &self.recipient)
            .await?;
        let ip = validate_ip(&claim.client_ip, self.allow_private)?;
        let entry = self.store.add_entry(&ip, &payment).await?;
        let rule_id = self.provider.allow(&ip, self.ttl_secs).await?;
        self.scheduler
            .schedule(&entry.id, &ip, Some(rule_id.clone()), entry.created_at)
            .await?;
        self.store.mark_used(&claim.transaction_id).await?;

        Ok(Grant { entry, rule_id })
    }

    pub async fn stats(&self) -> MonitorStats {
        MonitorStats {
            claims_seen: self.claims_seen.load(Ordering::Relaxed),
            grants_issued: self.grants_issued.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_event_at: *self.last_event.read().await,
            source_connected: self.source_connected.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, ProviderMode, VerifierMode};
    use crate::error::VerificationError;
    use crate::models::{Currency, LedgerFormat};
    use crate::services::firewall::MemoryProvider;
    use crate::services::simulated::SimulatedVerifier;
    use std::time::Duration;

    const RECIPIENT: &str = "0x4c9fab9a25c7014882b1a27c21a6286ab295dc3c6786c1314209e0b7eca9de81";
    const PRICE: u128 = 1_000_000;

    fn test_config(environment: Environment) -> Config {
        Config {
            environment,
            host: "127.0.0.1".to_string(),
            port: 0,
            payment_address: RECIPIENT.to_string(),
            price_octas: PRICE,
            currency: Currency::Move,
            network: "movement-testnet".to_string(),
            verifier_mode: VerifierMode::Simulated,
            simulated_seed: "monitor-test".to_string(),
            simulated_success_rate: 1.0,
            fullnode_url: None,
            provider_mode: ProviderMode::Memory,
            cloudflare_api_token: None,
            cloudflare_zone_id: None,
            cloudflare_api_base: "https://api.cloudflare.com/client/v4".to_string(),
            whitelist_duration_secs: 60,
            redis_url: None,
            snapshot_path: None,
        }
    }

    struct Fixture {
        verifier: Arc<SimulatedVerifier>,
        store: Arc<WhitelistStore>,
        provider: Arc<MemoryProvider>,
        scheduler: Arc<CleanupScheduler>,
        service: Arc<MonitoringService>,
    }

    async fn fixture(environment: Environment) -> Fixture {
        let config = test_config(environment);
        let verifier = Arc::new(SimulatedVerifier::new(
            &config.simulated_seed,
            config.simulated_success_rate,
        ));
        let store = Arc::new(WhitelistStore::new(None, None).await.expect("store builds"));
        let provider = Arc::new(MemoryProvider::new());
        let scheduler = Arc::new(CleanupScheduler::new(
            store.clone(),
            provider.clone(),
            config.whitelist_duration_secs,
        ));
        let service = Arc::new(MonitoringService::new(
            verifier.clone(),
            store.clone(),
            provider.clone(),
            scheduler.clone(),
            &config,
        ));
        Fixture {
            verifier,
            store,
            provider,
            scheduler,
            service,
        }
    }

    fn claim(hash: &str, ip: &str) -> PaymentClaim {
        PaymentClaim {
            transaction_id: hash.to_string(),
            client_ip: ip.to_string(),
        }
    }

    #[tokio::test]
    async fn pipeline_grants_access_for_a_valid_claim() {
        let fx = fixture(Environment::Development).await;
        let tx = fx.verifier.generate(LedgerFormat::Move, RECIPIENT, PRICE);
        assert!(tx.succeeded);

        let grant = fx
            .service
            .process(&claim(&tx.hash, "8.8.8.8"))
            .await
            .expect("granted");

        assert_eq!(grant.entry.ip_address, "8.8.8.8");
        assert!(fx.store.exists("8.8.8.8").await);
        assert!(fx.provider.is_allowed("8.8.8.8").await);
        assert!(fx.store.is_used(&tx.hash).await);
        assert_eq!(fx.scheduler.stats().await.active_timers, 1);

        let stats = fx.service.stats().await;
        assert_eq!(stats.claims_seen, 1);
        assert_eq!(stats.grants_issued, 1);
        assert_eq!(stats.failures, 0);
        assert!(stats.last_event_at.is_some());
    }

    #[tokio::test]
    async fn replayed_transaction_is_rejected_before_verification() {
        let fx = fixture(Environment::Development).await;
        let tx = fx.verifier.generate(LedgerFormat::Evm, RECIPIENT, PRICE);

        fx.service
            .process(&claim(&tx.hash, "8.8.8.8"))
            .await
            .expect("first grant");

        match fx.service.process(&claim(&tx.hash, "9.9.9.9")).await {
            Err(PaywallError::DuplicateTransaction(hash)) => assert_eq!(hash, tx.hash),
            other => panic!("expected duplicate rejection, got {:?}", other),
        }

        // The replaying IP got nothing.
        assert!(!fx.store.exists("9.9.9.9").await);

        let stats = fx.service.stats().await;
        assert_eq!(stats.claims_seen, 2);
        assert_eq!(stats.grants_issued, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn unknown_transaction_leaves_no_side_effects() {
        let fx = fixture(Environment::Development).await;
        let hash = format!("0x{}", "77".repeat(32));

        match fx.service.process(&claim(&hash, "8.8.8.8")).await {
            Err(PaywallError::Verification(VerificationError::NotFound)) => {}
            other => panic!("expected not-found, got {:?}", other),
        }

        assert!(!fx.store.exists("8.8.8.8").await);
        assert!(!fx.store.is_used(&hash).await);
        assert_eq!(fx.provider.active_rules().await, 0);
        assert_eq!(fx.service.stats().await.failures, 1);
    }

    #[tokio::test]
    async fn rejected_ip_does_not_burn_the_transaction() {
        let fx = fixture(Environment::Testnet).await;
        let tx = fx.verifier.generate(LedgerFormat::Move, RECIPIENT, PRICE);

        match fx.service.process(&claim(&tx.hash, "192.168.1.50")).await {
            Err(PaywallError::InvalidIp(_)) => {}
            other => panic!("expected ip rejection, got {:?}", other),
        }
        assert!(!fx.store.is_used(&tx.hash).await);

        // Same payment, acceptable IP: the retry goes through.
        fx.service
            .process(&claim(&tx.hash, "8.8.8.8"))
            .await
            .expect("retry granted");
        assert!(fx.store.is_used(&tx.hash).await);
    }

    #[tokio::test]
    async fn renewed_grant_replaces_row_and_timer() {
        let fx = fixture(Environment::Development).await;
        let first = fx.verifier.generate(LedgerFormat::Move, RECIPIENT, PRICE);
        let second = fx.verifier.generate(LedgerFormat::Move, RECIPIENT, PRICE);

        let grant_one = fx
            .service
            .process(&claim(&first.hash, "8.8.8.8"))
            .await
            .expect("granted");
        let grant_two = fx
            .service
            .process(&claim(&second.hash, "8.8.8.8"))
            .await
            .expect("renewed");

        assert_ne!(grant_one.entry.id, grant_two.entry.id);
        assert_eq!(fx.store.active_count().await, 1);
        assert_eq!(fx.scheduler.stats().await.active_timers, 1);
        // The memory provider reuses the rule covering the IP.
        assert_eq!(grant_one.rule_id, grant_two.rule_id);
    }

    #[tokio::test]
    async fn run_loop_consumes_claims_until_shutdown() {
        let fx = fixture(Environment::Development).await;
        let tx = fx.verifier.generate(LedgerFormat::Move, RECIPIENT, PRICE);

        let (sender, source) = channel_source(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(fx.service.clone().run(source, shutdown_rx));

        sender
            .send(claim(&tx.hash, "8.8.8.8"))
            .await
            .expect("claim sent");

        let mut processed = false;
        for _ in 0..100 {
            if fx.service.stats().await.claims_seen == 1 {
                processed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(processed, "claim was never consumed");
        assert!(fx.store.exists("8.8.8.8").await);
        assert!(fx.service.stats().await.source_connected);

        shutdown_tx.send(true).expect("signalled");
        handle.await.expect("run loop ended");
        assert!(!fx.service.stats().await.source_connected);
    }

    #[tokio::test]
    async fn closed_source_ends_the_run_loop() {
        let fx = fixture(Environment::Development).await;
        let (sender, source) = channel_source(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(fx.service.clone().run(source, shutdown_rx));

        drop(sender);
        handle.await.expect("run loop ended");

        // Pushing into a closed feed reports the service as not running.
        let (dead_sender, dead_source) = channel_source(1);
        drop(dead_source);
        match dead_sender
            .send(claim(&format!("0x{}", "aa".repeat(32)), "8.8.8.8"))
            .await
        {
            Err(PaywallError::NotRunning) => {}
            other => panic!("expected not-running, got {:?}", other),
        }
    }
}
