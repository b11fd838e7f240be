use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{Config, ProviderMode, VerifierMode};
use crate::error::PaywallError;
use crate::models::{
    Currency, HealthStatus, LogStats, PaymentClaim, SystemStatus, VerifyRequest,
};
use crate::services::{
    channel_source, ChainVerifier, ClaimSender, CleanupScheduler, CloudflareProvider, Grant,
    MemoryProvider, MonitoringService, SimulatedVerifier, TransactionVerifier, WhitelistProvider,
    WhitelistStore,
};

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;

const CLAIM_QUEUE_DEPTH: usize = 64;

/// Log volume counters fed by [`CountingLayer`] and surfaced through the
/// status API.
#[derive(Default)]
pub struct LogCounters {
    events: AtomicU64,
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl LogCounters {
    pub fn stats(&self) -> LogStats {
        LogStats {
            events: self.events.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Subscriber layer that counts every emitted event. Installed next to the
/// fmt layer in `main`; it never looks at fields, only levels.
pub struct CountingLayer {
    counters: Arc<LogCounters>,
}

impl CountingLayer {
    pub fn new(counters: Arc<LogCounters>) -> Self {
        Self { counters }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CountingLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        match *event.metadata().level() {
            tracing::Level::WARN => {
                self.counters.warnings.fetch_add(1, Ordering::Relaxed);
            }
            tracing::Level::ERROR => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

struct MonitorRuntime {
    claims: ClaimSender,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the whole paywall: verifier, store, firewall provider, cleanup
/// scheduler and monitoring loop, plus the `Stopped -> Running ->
/// ShuttingDown -> Stopped` lifecycle around them.
///
/// Shutdown is raced through a single atomic compare-exchange: exactly one
/// caller wins and performs the teardown sequence, every concurrent caller
/// fails immediately with `SHUTDOWN_IN_PROGRESS` instead of blocking behind
/// it.
pub struct PaywallApp {
    config: Config,
    verifier: Arc<dyn TransactionVerifier>,
    simulated: Option<Arc<SimulatedVerifier>>,
    store: Arc<WhitelistStore>,
    provider: Arc<dyn WhitelistProvider>,
    scheduler: Arc<CleanupScheduler>,
    monitor: Arc<MonitoringService>,
    log_counters: Arc<LogCounters>,
    state: AtomicU8,
    started_at: RwLock<Option<Instant>>,
    runtime: Mutex<Option<MonitorRuntime>>,
}

impl PaywallApp {
    /// Wires every service from the configuration. Nothing is started yet;
    /// `start` owns the transition to `Running`.
    pub async fn new(config: Config, log_counters: Arc<LogCounters>) -> Result<Self> {
        let (verifier, simulated): (Arc<dyn TransactionVerifier>, Option<Arc<SimulatedVerifier>>) =
            match config.verifier_mode {
                VerifierMode::Simulated => {
                    let sim = Arc::new(SimulatedVerifier::new(
                        &config.simulated_seed,
                        config.simulated_success_rate,
                    ));
                    (sim.clone(), Some(sim))
                }
                VerifierMode::Chain => {
                    let url = config
                        .fullnode_url
                        .as_deref()
                        .context("FULLNODE_URL required when VERIFIER_MODE=chain")?;
                    (Arc::new(ChainVerifier::new(url)?), None)
                }
            };

        let provider: Arc<dyn WhitelistProvider> = match config.provider_mode {
            ProviderMode::Cloudflare => {
                let token = config
                    .cloudflare_api_token
                    .as_deref()
                    .context("CLOUDFLARE_API_TOKEN required when PROVIDER_MODE=cloudflare")?;
                let zone = config
                    .cloudflare_zone_id
                    .as_deref()
                    .context("CLOUDFLARE_ZONE_ID required when PROVIDER_MODE=cloudflare")?;
                Arc::new(CloudflareProvider::new(
                    &config.cloudflare_api_base,
                    token,
                    zone,
                )?)
            }
            ProviderMode::Memory => Arc::new(MemoryProvider::new()),
        };

        let store = Arc::new(
            WhitelistStore::new(config.redis_url.as_deref(), config.snapshot_path.clone())
                .await
                .context("Whitelist store initialization failed")?,
        );

        let scheduler = Arc::new(CleanupScheduler::new(
            store.clone(),
            provider.clone(),
            config.whitelist_duration_secs,
        ));

        let monitor = Arc::new(MonitoringService::new(
            verifier.clone(),
            store.clone(),
            provider.clone(),
            scheduler.clone(),
            &config,
        ));

        Ok(Self {
            config,
            verifier,
            simulated,
            store,
            provider,
            scheduler,
            monitor,
            log_counters,
            state: AtomicU8::new(STATE_STOPPED),
            started_at: RwLock::new(None),
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The simulated verifier, when that mode is configured. The simulate
    /// endpoint uses this to mint test transactions.
    pub fn simulated(&self) -> Option<Arc<SimulatedVerifier>> {
        self.simulated.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub fn state_name(&self) -> &'static str {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => "running",
            STATE_SHUTTING_DOWN => "shutting_down",
            _ => "stopped",
        }
    }

    /// Validates configuration, recovers persisted grants and starts the
    /// monitoring loop. Fails without partial startup: a bring-up error
    /// rolls the state back to `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<(), PaywallError> {
        self.config
            .validate()
            .map_err(|e| PaywallError::ConfigInvalid(e.to_string()))?;

        // A scheduler that already cancelled its timers is spent; this app
        // instance cannot be brought back up.
        if self.scheduler.is_shut_down() {
            return Err(PaywallError::ShutdownInProgress);
        }

        match self.state.compare_exchange(
            STATE_STOPPED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_SHUTTING_DOWN) => return Err(PaywallError::ShutdownInProgress),
            Err(_) => {
                return Err(PaywallError::Internal(
                    "Application is already running".to_string(),
                ))
            }
        }

        if let Err(e) = self.bring_up().await {
            self.state.store(STATE_STOPPED, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!(
            verifier = self.verifier.mode(),
            provider = self.provider.mode(),
            ttl_secs = self.config.whitelist_duration_secs,
            "Bot paywall running"
        );
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), PaywallError> {
        // Sweep first: entries whose timers died with a previous process
        // must not be resurrected below.
        let swept = self.scheduler.reconcile(Utc::now()).await?;
        if swept > 0 {
            tracing::info!(count = swept, "Recovered stale grants from a previous run");
        }

        // Surviving rows get their timers back, deadlines re-derived from
        // the persisted creation time. Rule ids are not persisted; the
        // scheduler resolves them by IP when the timer fires.
        let survivors = self.store.list_all().await;
        for entry in &survivors {
            self.scheduler
                .schedule(&entry.id, &entry.ip_address, None, entry.created_at)
                .await?;
        }
        if !survivors.is_empty() {
            tracing::info!(count = survivors.len(), "Rescheduled surviving grants");
        }

        let (claims, source) = channel_source(CLAIM_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.monitor.clone().run(source, shutdown_rx));

        *self.runtime.lock().await = Some(MonitorRuntime {
            claims,
            shutdown: shutdown_tx,
            handle,
        });
        *self.started_at.write().await = Some(Instant::now());
        Ok(())
    }

    /// Tears everything down in order: monitoring loop, pending cleanup
    /// timers, then the store. Individual stop failures are collected and
    /// reported together; the app is `Stopped` afterwards either way.
    pub async fn graceful_shutdown(&self) -> Result<(), PaywallError> {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_SHUTTING_DOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_SHUTTING_DOWN) => return Err(PaywallError::ShutdownInProgress),
            Err(_) => return Err(PaywallError::NotRunning),
        }

        tracing::info!("Graceful shutdown started");
        let mut failures: Vec<String> = Vec::new();

        if let Some(runtime) = self.runtime.lock().await.take() {
            let _ = runtime.shutdown.send(true);
            if let Err(e) = runtime.handle.await {
                failures.push(format!("monitoring loop: {}", e));
            }
        }

        let cancelled = self.scheduler.cancel_pending().await;
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Cancelled pending cleanup timers");
        }

        if let Err(e) = self.store.close().await {
            failures.push(format!("store: {}", e));
        }

        *self.started_at.write().await = None;
        self.state.store(STATE_STOPPED, Ordering::SeqCst);

        if failures.is_empty() {
            tracing::info!("Graceful shutdown complete");
            Ok(())
        } else {
            for failure in &failures {
                tracing::error!("Shutdown step failed: {}", failure);
            }
            Err(PaywallError::Internal(format!(
                "Shutdown finished with {} error(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Manual counterpart of the monitoring pipeline. Optional overrides
    /// must match the configured price and currency exactly; there is no
    /// tiered pricing.
    pub async fn process_payment(&self, request: &VerifyRequest) -> Result<Grant, PaywallError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => {}
            STATE_SHUTTING_DOWN => return Err(PaywallError::ShutdownInProgress),
            _ => return Err(PaywallError::NotRunning),
        }

        if let Some(amount) = request.expected_amount {
            if amount != self.config.price_octas {
                return Err(PaywallError::ConfigInvalid(format!(
                    "expectedAmount {} does not match the accepted price {}",
                    amount, self.config.price_octas
                )));
            }
        }
        if let Some(currency) = request.expected_currency.as_deref() {
            if Currency::parse(currency) != Some(self.config.currency) {
                return Err(PaywallError::ConfigInvalid(format!(
                    "expectedCurrency {} is not accepted; only {} payments are",
                    currency, self.config.currency
                )));
            }
        }

        self.monitor
            .process(&PaymentClaim {
                transaction_id: request.transaction_id.clone(),
                client_ip: request.client_ip.clone(),
            })
            .await
    }

    /// Pushes a claim into the monitoring queue without waiting for the
    /// pipeline outcome.
    pub async fn submit_claim(&self, claim: PaymentClaim) -> Result<(), PaywallError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => {}
            STATE_SHUTTING_DOWN => return Err(PaywallError::ShutdownInProgress),
            _ => return Err(PaywallError::NotRunning),
        }

        let sender = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| runtime.claims.clone());
        match sender {
            Some(sender) => sender.send(claim).await,
            None => Err(PaywallError::NotRunning),
        }
    }

    pub async fn status(&self) -> SystemStatus {
        let uptime_seconds = match *self.started_at.read().await {
            Some(at) => at.elapsed().as_secs(),
            None => 0,
        };

        SystemStatus {
            is_running: self.is_running(),
            state: self.state_name().to_string(),
            uptime_seconds,
            monitoring: self.monitor.stats().await,
            cleanup: self.scheduler.stats().await,
            log_stats: self.log_counters.stats(),
            database_connected: self.store.ping().await,
            cloudflare_connected: self.provider.ping().await,
            timestamp: Utc::now(),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        let database = self.store.ping().await;
        let firewall = self.provider.ping().await;
        let uptime_seconds = match *self.started_at.read().await {
            Some(at) => at.elapsed().as_secs(),
            None => 0,
        };

        HealthStatus {
            status: if database && firewall { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
            firewall,
            uptime_seconds,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::models::LedgerFormat;

    fn test_config() -> Config {
        Config {
            environment: Environment::Development,
            host: "127.0.0.1".to_string(),
            port: 0,
            payment_address:
                "0x4c9fab9a25c7014882b1a27c21a6286ab295dc3c6786c1314209e0b7eca9de81".to_string(),
            price_octas: 1_000_000,
            currency: Currency::Move,
            network: "movement-testnet".to_string(),
            verifier_mode: VerifierMode::Simulated,
            simulated_seed: "app-test".to_string(),
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

    async fn running_app(config: Config) -> Arc<PaywallApp> {
        let app = Arc::new(
            PaywallApp::new(config, Arc::new(LogCounters::default()))
                .await
                .expect("app builds"),
        );
        app.start().await.expect("app starts");
        app
    }

    fn verify_request(hash: &str, ip: &str) -> VerifyRequest {
        VerifyRequest {
            transaction_id: hash.to_string(),
            client_ip: ip.to_string(),
            expected_amount: None,
            expected_currency: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_start_status_shutdown() {
        let app = running_app(test_config()).await;
        assert!(app.is_running());
        assert_eq!(app.state_name(), "running");

        let status = app.status().await;
        assert!(status.is_running);
        assert_eq!(status.state, "running");
        assert!(status.database_connected);
        assert!(status.cloudflare_connected);

        app.graceful_shutdown().await.expect("clean shutdown");
        assert!(!app.is_running());
        assert_eq!(app.state_name(), "stopped");
        assert!(!app.status().await.is_running);
    }

    #[tokio::test]
    async fn start_rejects_invalid_configuration() {
        let mut config = test_config();
        config.payment_address = "not-an-address".to_string();
        let app = Arc::new(
            PaywallApp::new(config, Arc::new(LogCounters::default()))
                .await
                .expect("app builds"),
        );

        match app.start().await {
            Err(PaywallError::ConfigInvalid(message)) => {
                assert!(message.contains("PAYMENT_ADDRESS"))
            }
            other => panic!("expected config rejection, got {:?}", other),
        }
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let app = running_app(test_config()).await;
        match app.start().await {
            Err(PaywallError::Internal(message)) => assert!(message.contains("already running")),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_before_start_reports_not_running() {
        let app = Arc::new(
            PaywallApp::new(test_config(), Arc::new(LogCounters::default()))
                .await
                .expect("app builds"),
        );
        match app.graceful_shutdown().await {
            Err(PaywallError::NotRunning) => {}
            other => panic!("expected not-running, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn second_shutdown_reports_not_running() {
        let app = running_app(test_config()).await;
        app.graceful_shutdown().await.expect("clean shutdown");
        match app.graceful_shutdown().await {
            Err(PaywallError::NotRunning) => {}
            other => panic!("expected not-running, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_shutdown_runs_once() {
        let app = running_app(test_config()).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let app = app.clone();
            handles.push(tokio::spawn(async move { app.graceful_shutdown().await }));
        }

        let mut completed = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.expect("task finished") {
                Ok(()) => completed += 1,
                Err(PaywallError::ShutdownInProgress) => refused += 1,
                other => panic!("unexpected shutdown outcome: {:?}", other),
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(refused, 3);
        assert_eq!(app.state_name(), "stopped");
    }

    #[tokio::test]
    async fn restart_after_shutdown_is_refused() {
        let app = running_app(test_config()).await;
        app.graceful_shutdown().await.expect("clean shutdown");
        match app.start().await {
            Err(PaywallError::ShutdownInProgress) => {}
            other => panic!("expected restart refusal, got {:?}", other),
        }
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn manual_payment_runs_the_pipeline() {
        let app = running_app(test_config()).await;
        let sim = app.simulated().expect("simulated mode");
        let tx = sim.generate(
            LedgerFormat::Move,
            &app.config().payment_address,
            app.config().price_octas,
        );

        let grant = app
            .process_payment(&verify_request(&tx.hash, "8.8.8.8"))
            .await
            .expect("granted");
        assert_eq!(grant.entry.ip_address, "8.8.8.8");

        let status = app.status().await;
        assert_eq!(status.monitoring.grants_issued, 1);
        assert_eq!(status.cleanup.active_timers, 1);
    }

    #[tokio::test]
    async fn mismatched_overrides_are_rejected() {
        let app = running_app(test_config()).await;
        let sim = app.simulated().expect("simulated mode");
        let tx = sim.generate(
            LedgerFormat::Move,
            &app.config().payment_address,
            app.config().price_octas,
        );

        let mut request = verify_request(&tx.hash, "8.8.8.8");
        request.expected_amount = Some(app.config().price_octas + 1);
        match app.process_payment(&request).await {
            Err(PaywallError::ConfigInvalid(message)) => {
                assert!(message.contains("expectedAmount"))
            }
            other => panic!("expected override rejection, got {:?}", other),
        }

        let mut request = verify_request(&tx.hash, "8.8.8.8");
        request.expected_currency = Some("USDC".to_string());
        match app.process_payment(&request).await {
            Err(PaywallError::ConfigInvalid(message)) => {
                assert!(message.contains("expectedCurrency"))
            }
            other => panic!("expected override rejection, got {:?}", other),
        }

        // Matching overrides are fine.
        let mut request = verify_request(&tx.hash, "8.8.8.8");
        request.expected_amount = Some(app.config().price_octas);
        request.expected_currency = Some("MOVE".to_string());
        app.process_payment(&request).await.expect("granted");
    }

    #[tokio::test]
    async fn payments_after_shutdown_are_refused() {
        let app = running_app(test_config()).await;
        app.graceful_shutdown().await.expect("clean shutdown");

        let request = verify_request(&format!("0x{}", "ab".repeat(32)), "8.8.8.8");
        match app.process_payment(&request).await {
            Err(PaywallError::NotRunning) => {}
            other => panic!("expected not-running, got {:?}", other),
        }
        match app
            .submit_claim(PaymentClaim {
                transaction_id: format!("0x{}", "ab".repeat(32)),
                client_ip: "8.8.8.8".to_string(),
            })
            .await
        {
            Err(PaywallError::NotRunning) => {}
            other => panic!("expected not-running, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_recovers_persisted_grants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("whitelist.json");

        // A previous process left one live grant and one stale grant.
        {
            let store = WhitelistStore::new(None, Some(path.clone()))
                .await
                .expect("store builds");
            let payment = crate::models::PaymentRecord::verified(
                &format!("0x{}", "ab".repeat(32)),
                1_000_000,
                "0xpayer",
            );
            let mut live = store.add_entry("8.8.8.8", &payment).await.expect("added");
            live.created_at = Utc::now() - chrono::Duration::seconds(30);
            store.update(live).await.expect("backdated");

            let stale_payment = crate::models::PaymentRecord::verified(
                &format!("0x{}", "cd".repeat(32)),
                1_000_000,
                "0xpayer",
            );
            let mut stale = store.add_entry("9.9.9.9", &stale_payment).await.expect("added");
            stale.created_at = Utc::now() - chrono::Duration::seconds(600);
            store.update(stale).await.expect("backdated");
            store.close().await.expect("closed");
        }

        let mut config = test_config();
        config.snapshot_path = Some(path);
        let app = running_app(config).await;

        let status = app.status().await;
        assert_eq!(status.cleanup.reconciled_total, 1);
        assert_eq!(status.cleanup.active_timers, 1);
    }

    #[tokio::test]
    async fn log_counters_track_levels() {
        let counters = LogCounters::default();
        counters.events.fetch_add(3, Ordering::Relaxed);
        counters.warnings.fetch_add(1, Ordering::Relaxed);

        let stats = counters.stats();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.errors, 0);
    }
}
