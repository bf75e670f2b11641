//! Configuration management for the settlement engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{EngineError, EngineResult};
use crate::types::{AssetLocation, AssetSymbol, ChainKey, VaultDescriptor, WithdrawMethod};

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    pub settlement: SettlementConfig,
    pub bridge: BridgeConfig,
    pub swap: SwapConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub vaults: HashMap<String, VaultConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub instance_id: String,
    /// Extra attempts for idempotent reads (balance, quote)
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// How long to wait for a submitted transaction to be mined
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Pause before the single resend after a nonce conflict
    #[serde(default = "default_nonce_retry_backoff_ms")]
    pub nonce_retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// The single chain on which requests are settled
    pub chain: ChainKey,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Fraction of the incoming amount, in basis points, that counts as arrived
    #[serde(default = "default_arrival_threshold_bps")]
    pub arrival_threshold_bps: u64,
    /// Dust tolerance in whole units of the asset
    #[serde(default = "default_dust_tolerance")]
    pub dust_tolerance: String,
    /// Native balance left on every chain to pay for gas, in whole units
    #[serde(default = "default_native_gas_reserve")]
    pub native_gas_reserve: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub api_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    pub api_url: String,
    #[serde(default)]
    pub referral_code: u64,
    #[serde(default = "default_slippage_percent")]
    pub slippage_percent: f64,
    #[serde(default = "default_fallback_gas_limit")]
    pub fallback_gas_limit: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// How long finished settlement jobs stay queryable
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signing key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub spoke_pool: String,
    #[serde(default)]
    pub swap_router: Option<String>,
    #[serde(default)]
    pub tokens: TokenAddresses,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenAddresses {
    pub usdc: Option<String>,
    pub usdt: Option<String>,
    pub weth: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub asset: AssetSymbol,
    pub deposit_contract: String,
    pub primary: String,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default = "default_withdraw_method")]
    pub withdraw_method: WithdrawMethod,
}

fn default_read_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_confirmation_timeout_secs() -> u64 {
    180
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_poll_attempts() -> u32 {
    40
}

fn default_arrival_threshold_bps() -> u64 {
    9_500
}

fn default_dust_tolerance() -> String {
    "0.000001".to_string()
}

fn default_nonce_retry_backoff_ms() -> u64 {
    2_000
}

fn default_native_gas_reserve() -> String {
    "0.0005".to_string()
}

fn default_job_retention_secs() -> u64 {
    3_600
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_slippage_percent() -> f64 {
    0.5
}

fn default_fallback_gas_limit() -> u64 {
    3_000_000
}

fn default_private_key_env() -> String {
    "ENGINE_PRIVATE_KEY".to_string()
}

fn default_withdraw_method() -> WithdrawMethod {
    WithdrawMethod::Withdraw
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("SETTLEMENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> EngineResult<()> {
        if self.enabled_chains().is_empty() {
            return Err(EngineError::Config(
                "At least one chain must be enabled".to_string(),
            ));
        }

        self.gas_reserve(AssetLocation::Native).map_err(|e| {
            EngineError::Config(format!("Invalid settlement.native_gas_reserve: {}", e))
        })?;

        for (name, chain) in &self.chains {
            let key: ChainKey = name.parse()?;
            if chain.chain_id != key.chain_id() {
                return Err(EngineError::Config(format!(
                    "Chain {} declares chain_id {}, expected {}",
                    name,
                    chain.chain_id,
                    key.chain_id()
                )));
            }
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    return Err(EngineError::Config(format!(
                        "Chain {} has no RPC URLs configured",
                        name
                    )));
                }
                parse_address(&chain.spoke_pool, "spoke_pool")?;
                if chain.tokens.weth.is_none() {
                    tracing::warn!("Chain {} has no weth token - native bridging disabled", name);
                }
            }
        }

        let settlement = self.settlement.chain;
        if !self.enabled_chains().iter().any(|(k, _)| *k == settlement) {
            return Err(EngineError::Config(format!(
                "Settlement chain {} is not an enabled chain",
                settlement
            )));
        }

        if self.settlement.arrival_threshold_bps == 0 || self.settlement.arrival_threshold_bps > 10_000 {
            return Err(EngineError::Config(
                "arrival_threshold_bps must be within 1..=10000".to_string(),
            ));
        }

        for asset in [AssetSymbol::Usdc, AssetSymbol::Usdt, AssetSymbol::Eth] {
            self.dust(asset)?;
        }

        for id in self.vaults.keys() {
            self.vault(id)?;
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(ChainKey, &ChainConfig)> {
        let mut chains: Vec<_> = self
            .chains
            .iter()
            .filter(|(_, c)| c.enabled)
            .filter_map(|(name, c)| name.parse::<ChainKey>().ok().map(|k| (k, c)))
            .collect();
        chains.sort_by_key(|(k, _)| *k);
        chains
    }

    /// Get chain config by key
    pub fn chain(&self, chain: ChainKey) -> EngineResult<&ChainConfig> {
        self.chains
            .iter()
            .find(|(name, c)| c.enabled && name.parse::<ChainKey>().ok() == Some(chain))
            .map(|(_, c)| c)
            .ok_or(EngineError::ChainNotFound { chain })
    }

    /// Dust tolerance for an asset, in base units (at least one)
    pub fn dust(&self, asset: AssetSymbol) -> EngineResult<U256> {
        let dust = asset.parse_amount(&self.settlement.dust_tolerance)?;
        Ok(dust.max(U256::one()))
    }

    /// Balance kept back from `location` for gas; zero for tokens
    pub fn gas_reserve(&self, location: AssetLocation) -> EngineResult<U256> {
        match location {
            AssetLocation::Native => AssetSymbol::Eth.parse_amount(&self.settlement.native_gas_reserve),
            AssetLocation::Token(_) => Ok(U256::zero()),
        }
    }

    /// What can be moved out of `balance` once the gas reserve is kept
    pub fn spendable(&self, location: AssetLocation, balance: U256) -> EngineResult<U256> {
        Ok(balance.saturating_sub(self.gas_reserve(location)?))
    }

    pub fn nonce_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.engine.nonce_retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.settlement.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.request_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.confirmation_timeout_secs)
    }

    /// Resolve a vault id into its descriptor
    pub fn vault(&self, id: &str) -> EngineResult<VaultDescriptor> {
        let config = self
            .vaults
            .get(id)
            .ok_or_else(|| EngineError::UnknownVault(id.to_string()))?;
        let chain = self.settlement.chain;

        let token = match self.asset_location(chain, config.asset)? {
            AssetLocation::Token(token) => token,
            AssetLocation::Native => {
                return Err(EngineError::Config(format!(
                    "Vault {} cannot hold the native asset",
                    id
                )))
            }
        };

        Ok(VaultDescriptor {
            id: id.to_string(),
            chain,
            asset: config.asset,
            token,
            deposit_contract: parse_address(&config.deposit_contract, "deposit_contract")?,
            primary: parse_address(&config.primary, "primary")?,
            secondary: config
                .secondary
                .as_deref()
                .map(|s| parse_address(s, "secondary"))
                .transpose()?,
            withdraw_method: config.withdraw_method,
        })
    }

    /// Where an asset is held on a chain
    pub fn asset_location(&self, chain: ChainKey, asset: AssetSymbol) -> EngineResult<AssetLocation> {
        if asset.is_native() {
            return Ok(AssetLocation::Native);
        }
        let tokens = &self.chain(chain)?.tokens;
        let address = match asset {
            AssetSymbol::Usdc => tokens.usdc.as_deref(),
            AssetSymbol::Usdt => tokens.usdt.as_deref(),
            AssetSymbol::Eth => None,
        }
        .ok_or(EngineError::UnsupportedAsset { chain, asset })?;
        Ok(AssetLocation::Token(parse_address(address, asset.as_str())?))
    }

    /// The token that represents an asset on the bridge (wrapped for native)
    pub fn bridge_token(&self, chain: ChainKey, asset: AssetSymbol) -> EngineResult<Address> {
        match self.asset_location(chain, asset)? {
            AssetLocation::Token(token) => Ok(token),
            AssetLocation::Native => self.wrapped_native(chain),
        }
    }

    pub fn wrapped_native(&self, chain: ChainKey) -> EngineResult<Address> {
        let weth = self
            .chain(chain)?
            .tokens
            .weth
            .as_deref()
            .ok_or(EngineError::UnsupportedAsset {
                chain,
                asset: AssetSymbol::Eth,
            })?;
        parse_address(weth, "weth")
    }

    pub fn spoke_pool(&self, chain: ChainKey) -> EngineResult<Address> {
        parse_address(&self.chain(chain)?.spoke_pool, "spoke_pool")
    }

    pub fn swap_router(&self, chain: ChainKey) -> EngineResult<Address> {
        let router = self
            .chain(chain)?
            .swap_router
            .as_deref()
            .ok_or_else(|| EngineError::Config(format!("No swap router configured for {}", chain)))?;
        parse_address(router, "swap_router")
    }
}

fn parse_address(value: &str, field: &str) -> EngineResult<Address> {
    value
        .parse()
        .map_err(|e| EngineError::Config(format!("Invalid {} address {}: {}", field, value, e)))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
