//! Layered configuration: defaults, then `lease_ledger.toml`, then environment.
//!
//! Environment keys use the `LEASE_` prefix with `__` between section and key,
//! e.g. `LEASE_LEDGER__RPC_URL`. The legacy `INFURA_URL` maps onto
//! `ledger.rpc_url`.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "lease_ledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// Remote EVM JSON-RPC endpoint.
    Rpc,
    /// In-process chain, no network.
    Dev,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_mode")]
    pub mode: LedgerMode,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_nonce_retry_attempts")]
    pub nonce_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_dev_gas_price_wei")]
    pub dev_gas_price_wei: u128,
    #[serde(default = "default_dev_block_gas_limit")]
    pub dev_block_gas_limit: u64,
}

fn default_ledger_mode() -> LedgerMode {
    LedgerMode::Rpc
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_nonce_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_dev_gas_price_wei() -> u128 {
    1_000_000_000
}

fn default_dev_block_gas_limit() -> u64 {
    30_000_000
}

impl LedgerConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: default_ledger_mode(),
            rpc_url: default_rpc_url(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            nonce_retry_attempts: default_nonce_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            dev_gas_price_wei: default_dev_gas_price_wei(),
            dev_block_gas_limit: default_dev_block_gas_limit(),
        }
    }
}

/// Credential token storage.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_dir")]
    pub dir: PathBuf,
    /// Files older than this are pruned; unset keeps them forever.
    #[serde(default)]
    pub retention_secs: Option<u64>,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_token_dir() -> PathBuf {
    PathBuf::from("qr_codes")
}

fn default_prune_interval_secs() -> u64 {
    3600
}

impl TokenConfig {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            dir: default_token_dir(),
            retention_secs: None,
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsightConfig {
    /// Image captioning inference endpoint.
    #[serde(default)]
    pub caption_endpoint: Option<String>,
    #[serde(default)]
    pub api_token: Option<Secret<String>>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            caption_endpoint: None,
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), json: false }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub insight: InsightConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Loads from `LEASE_CONFIG` (or the default file) plus the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("LEASE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::raw().only(&["INFURA_URL"]).map(|_| "ledger.rpc_url".into()))
            .merge(Env::prefixed("LEASE_").split("__"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults_apply_without_any_source() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load_from("missing.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 5000);
            assert_eq!(config.ledger.mode, LedgerMode::Rpc);
            assert_eq!(config.ledger.nonce_retry_attempts, 3);
            assert_eq!(config.tokens.dir, PathBuf::from("qr_codes"));
            assert!(config.tokens.retention().is_none());
            assert!(config.insight.caption_endpoint.is_none());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "lease_ledger.toml",
                r#"
                [server]
                port = 8080

                [ledger]
                mode = "dev"
                confirmation_timeout_secs = 5

                [tokens]
                retention_secs = 86400
                "#,
            )?;
            jail.set_env("LEASE_SERVER__PORT", "9090");
            jail.set_env("LEASE_INSIGHT__API_TOKEN", "hf_secret");

            let config = AppConfig::load_from("lease_ledger.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 9090);
            assert_eq!(config.ledger.mode, LedgerMode::Dev);
            assert_eq!(config.ledger.confirmation_timeout(), Duration::from_secs(5));
            assert_eq!(config.tokens.retention(), Some(Duration::from_secs(86400)));
            let token = config.insight.api_token.as_ref().map(|t| t.expose_secret().clone());
            assert_eq!(token.as_deref(), Some("hf_secret"));
            assert!(!format!("{:?}", config.insight).contains("hf_secret"));
            Ok(())
        });
    }

    #[test]
    fn legacy_infura_url_is_honored() {
        Jail::expect_with(|jail| {
            jail.set_env("INFURA_URL", "https://sepolia.example/v3/key");
            let config = AppConfig::load_from("missing.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.ledger.rpc_url, "https://sepolia.example/v3/key");
            Ok(())
        });
    }
}
