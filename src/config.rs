//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the custody API key) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::engine::fees::FeeSchedule;
use crate::engine::settlement::RetryPolicy;
use crate::engine::ProtocolRules;
use crate::ledger::simulated::SimulatedLedgerConfig;
use crate::types::{Address, Wei};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub protocol: ProtocolConfig,
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolConfig {
    #[serde(default = "default_premium_bps")]
    pub premium_bps: u32,
    #[serde(default = "default_coverage_bps")]
    pub coverage_bps: u32,
    #[serde(default = "default_cancel_timeout_secs")]
    pub cancel_timeout_secs: u64,
    pub arbitrator: String,
    pub treasury: String,
    #[serde(default)]
    pub yield_enabled: bool,
    /// Share of realised yield paid to the winner; the treasury keeps the rest.
    #[serde(default = "default_winner_yield_share_bps")]
    pub winner_yield_share_bps: u32,
}

fn default_premium_bps() -> u32 {
    500
}

fn default_coverage_bps() -> u32 {
    9_000
}

fn default_cancel_timeout_secs() -> u64 {
    86_400
}

fn default_winner_yield_share_bps() -> u32 {
    10_000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Simulated,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_roll_forward")]
    pub max_roll_forward: u32,
    pub http: Option<HttpLedgerConfig>,
    pub simulated: Option<SimulatedConfig>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_roll_forward() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpLedgerConfig {
    pub endpoint: String,
    /// Name of the env var holding the bearer token, if the service needs one.
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SimulatedConfig {
    #[serde(default)]
    pub yield_bps: u32,
    #[serde(default)]
    pub confirmations_required: u32,
    /// Decimal wei string.
    #[serde(default)]
    pub fee_wei: Wei,
    /// Decimal ETH string.
    #[serde(default)]
    pub insurance_pool_seed: Option<String>,
    /// Address → starting balance (decimal ETH string).
    #[serde(default)]
    pub accounts: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

fn default_snapshot_path() -> String {
    "wager_state.json".to_string()
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.protocol.rules()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

impl ProtocolConfig {
    /// Validate and convert into the rules the engine enforces.
    pub fn rules(&self) -> Result<ProtocolRules> {
        let fees = FeeSchedule {
            premium_bps: self.premium_bps,
            coverage_bps: self.coverage_bps,
            winner_yield_share_bps: self.winner_yield_share_bps,
        };
        if let Err(msg) = fees.validate() {
            bail!("Invalid [protocol] rates: {msg}");
        }
        let arbitrator = Address::parse(&self.arbitrator)
            .with_context(|| format!("Invalid [protocol] arbitrator: {}", self.arbitrator))?;
        let treasury = Address::parse(&self.treasury)
            .with_context(|| format!("Invalid [protocol] treasury: {}", self.treasury))?;
        let secs = i64::try_from(self.cancel_timeout_secs)
            .context("[protocol] cancel_timeout_secs is too large")?;

        Ok(ProtocolRules {
            fees,
            cancel_timeout: chrono::Duration::seconds(secs),
            arbitrator,
            treasury,
            yield_enabled: self.yield_enabled,
        })
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            poll_attempts: self.poll_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_roll_forward: self.max_roll_forward.max(1),
        }
    }
}

impl SimulatedConfig {
    pub fn ledger_config(&self) -> Result<SimulatedLedgerConfig> {
        let insurance_pool_seed = match &self.insurance_pool_seed {
            Some(eth) => Wei::from_eth_str(eth)
                .with_context(|| format!("Invalid insurance_pool_seed: {eth}"))?,
            None => Wei::ZERO,
        };
        Ok(SimulatedLedgerConfig {
            yield_bps: self.yield_bps,
            confirmations_required: self.confirmations_required,
            fee: self.fee_wei,
            insurance_pool_seed,
        })
    }

    /// Starting balances, parsed.
    pub fn funded_accounts(&self) -> Result<Vec<(Address, Wei)>> {
        let mut accounts = self
            .accounts
            .iter()
            .map(|(addr, eth)| {
                let address = Address::parse(addr)
                    .with_context(|| format!("Invalid funded account address: {addr}"))?;
                let amount = Wei::from_eth_str(eth)
                    .with_context(|| format!("Invalid balance for {addr}: {eth}"))?;
                Ok((address, amount))
            })
            .collect::<Result<Vec<_>>>()?;
        accounts.sort();
        Ok(accounts)
    }
}
