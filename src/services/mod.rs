pub mod chain;
pub mod cleanup;
pub mod firewall;
pub mod monitor;
pub mod simulated;
pub mod store;
pub mod verifier;

pub use chain::ChainVerifier;
pub use cleanup::CleanupScheduler;
pub use firewall::{validate_ip, CloudflareProvider, MemoryProvider, WhitelistProvider};
pub use monitor::{
    channel_source, ChannelSource, ClaimSender, Grant, MonitoringService, MonitoringSource,
};
pub use simulated::SimulatedVerifier;
pub use store::WhitelistStore;
pub use verifier::TransactionVerifier;
