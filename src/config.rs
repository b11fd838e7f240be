use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use crate::models::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

/// Which transaction verifier backs the paywall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    Simulated,
    Chain,
}

/// Which firewall provider receives whitelist rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Cloudflare,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub host: String,
    pub port: u16,

    // Payment terms advertised to bots
    pub payment_address: String,
    pub price_octas: u128,
    pub currency: Currency,
    pub network: String,

    // Transaction verification
    pub verifier_mode: VerifierMode,
    pub simulated_seed: String,
    pub simulated_success_rate: f64,
    pub fullnode_url: Option<String>,

    // Firewall provider
    pub provider_mode: ProviderMode,
    pub cloudflare_api_token: Option<String>,
    pub cloudflare_zone_id: Option<String>,
    pub cloudflare_api_base: String,

    // Whitelist lifecycle
    pub whitelist_duration_secs: u64,

    // Persistence
    pub redis_url: Option<String>,
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let environment = Self::parse_environment()?;

        let config = Self {
            environment,
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid PORT")?,

            payment_address: std::env::var("PAYMENT_ADDRESS")
                .context("PAYMENT_ADDRESS required")?,
            price_octas: std::env::var("PAYMENT_AMOUNT_OCTAS")
                .unwrap_or_else(|_| "1000000".to_string())
                .parse()
                .context("Invalid PAYMENT_AMOUNT_OCTAS")?,
            currency: Self::parse_currency()?,
            network: std::env::var("CHAIN_NETWORK")
                .unwrap_or_else(|_| "movement-testnet".to_string()),

            verifier_mode: Self::parse_verifier_mode()?,
            simulated_seed: std::env::var("SIMULATED_SEED")
                .unwrap_or_else(|_| "paywall-dev".to_string()),
            simulated_success_rate: std::env::var("SIMULATED_SUCCESS_RATE")
                .unwrap_or_else(|_| "0.9".to_string())
                .parse()
                .context("Invalid SIMULATED_SUCCESS_RATE")?,
            fullnode_url: std::env::var("FULLNODE_URL").ok(),

            provider_mode: Self::parse_provider_mode()?,
            cloudflare_api_token: std::env::var("CLOUDFLARE_API_TOKEN").ok(),
            cloudflare_zone_id: std::env::var("CLOUDFLARE_ZONE_ID").ok(),
            cloudflare_api_base: std::env::var("CLOUDFLARE_API_BASE")
                .unwrap_or_else(|_| "https://api.cloudflare.com/client/v4".to_string()),

            whitelist_duration_secs: std::env::var("WHITELIST_DURATION_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("Invalid WHITELIST_DURATION_SECS")?,

            redis_url: std::env::var("REDIS_URL").ok(),
            snapshot_path: std::env::var("SNAPSHOT_PATH").ok().map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn dev_mode(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn whitelist_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.whitelist_duration_secs)
    }

    fn parse_environment() -> Result<Environment> {
        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        match env.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testnet" | "test" => Ok(Environment::Testnet),
            "production" | "prod" => Ok(Environment::Production),
            _ => bail!("Unknown environment: {}", env),
        }
    }

    fn parse_verifier_mode() -> Result<VerifierMode> {
        let mode = std::env::var("VERIFIER_MODE").unwrap_or_else(|_| "simulated".to_string());

        match mode.to_lowercase().as_str() {
            "simulated" | "sim" => Ok(VerifierMode::Simulated),
            "chain" => Ok(VerifierMode::Chain),
            _ => bail!("Unknown verifier mode: {}", mode),
        }
    }

    fn parse_provider_mode() -> Result<ProviderMode> {
        let mode = std::env::var("PROVIDER_MODE").unwrap_or_else(|_| "memory".to_string());

        match mode.to_lowercase().as_str() {
            "cloudflare" | "cf" => Ok(ProviderMode::Cloudflare),
            "memory" | "mem" => Ok(ProviderMode::Memory),
            _ => bail!("Unknown provider mode: {}", mode),
        }
    }

    fn parse_currency() -> Result<Currency> {
        let raw = std::env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "MOVE".to_string());
        Currency::parse(&raw).with_context(|| format!("Unknown currency: {}", raw))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.payment_address.starts_with("0x")
            || hex::decode(&self.payment_address[2..]).is_err()
        {
            bail!("PAYMENT_ADDRESS must be a 0x-prefixed hex address");
        }

        if self.price_octas == 0 {
            bail!("PAYMENT_AMOUNT_OCTAS must be positive");
        }

        if self.whitelist_duration_secs == 0 {
            bail!("WHITELIST_DURATION_SECS must be positive");
        }

        if self.verifier_mode == VerifierMode::Chain {
            match &self.fullnode_url {
                Some(url) if url.starts_with("http") => {}
                Some(_) => bail!("FULLNODE_URL must be an HTTP(S) URL"),
                None => bail!("FULLNODE_URL required when VERIFIER_MODE=chain"),
            }
        }

        if self.provider_mode == ProviderMode::Cloudflare {
            if self.cloudflare_api_token.as_deref().unwrap_or("").is_empty() {
                bail!("CLOUDFLARE_API_TOKEN required when PROVIDER_MODE=cloudflare");
            }
            if self.cloudflare_zone_id.as_deref().unwrap_or("").is_empty() {
                bail!("CLOUDFLARE_ZONE_ID required when PROVIDER_MODE=cloudflare");
            }
        }

        if self.verifier_mode == VerifierMode::Simulated
            && self.environment == Environment::Production
        {
            tracing::warn!("Simulated verifier enabled in production environment");
        }

        tracing::info!(
            "Configuration validated for {:?} environment",
            self.environment
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            environment: Environment::Development,
            host: "127.0.0.1".to_string(),
            port: 8080,
            payment_address:
                "0x4c9fab9a25c7014882b1a27c21a6286ab295dc3c6786c1314209e0b7eca9de81".to_string(),
            price_octas: 1_000_000,
            currency: Currency::Move,
            network: "movement-testnet".to_string(),
            verifier_mode: VerifierMode::Simulated,
            simulated_seed: "test-seed".to_string(),
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

    #[test]
    fn valid_simulated_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn chain_mode_requires_fullnode_url() {
        let mut config = base_config();
        config.verifier_mode = VerifierMode::Chain;
        assert!(config.validate().is_err());

        config.fullnode_url = Some("https://fullnode.testnet.example.com/v1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cloudflare_mode_requires_credentials() {
        let mut config = base_config();
        config.provider_mode = ProviderMode::Cloudflare;
        assert!(config.validate().is_err());

        config.cloudflare_api_token = Some("token".to_string());
        config.cloudflare_zone_id = Some("zone".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_payment_address() {
        let mut config = base_config();
        config.payment_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        config.payment_address = "0xzzzz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_duration_and_price() {
        let mut config = base_config();
        config.whitelist_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.price_octas = 0;
        assert!(config.validate().is_err());
    }
}
