//! Chain module - multi-chain connections and balance reads
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The [`ChainReader`] seam used by every component that reads chain state
//! - Parallel balance aggregation across chains

pub mod aggregator;
pub mod provider;

pub use aggregator::BalanceAggregator;
pub use provider::{ChainProvider, GasPrice, SimulationResult};

use crate::config::Settings;
use crate::contracts::{calldata, decode_uint, erc20, vault as vault_abi};
use crate::error::{EngineError, EngineResult};
use crate::types::{AssetLocation, ChainKey, TxCall};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, U256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Read access to chain state
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Native or token balance of `owner`
    async fn balance_of(
        &self,
        chain: ChainKey,
        location: AssetLocation,
        owner: Address,
    ) -> EngineResult<U256>;

    /// ERC-20 allowance granted by `owner` to `spender`
    async fn allowance(
        &self,
        chain: ChainKey,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> EngineResult<U256>;

    /// Asset value of `owner`'s position in a vault
    async fn vault_assets(&self, chain: ChainKey, vault: Address, owner: Address)
        -> EngineResult<U256>;

    /// Vault shares corresponding to an asset amount
    async fn vault_shares(&self, chain: ChainKey, vault: Address, assets: U256)
        -> EngineResult<U256>;

    /// Dry-run a call as `from`
    async fn simulate(
        &self,
        chain: ChainKey,
        from: Address,
        call: &TxCall,
    ) -> EngineResult<SimulationResult>;
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain key
    providers: DashMap<ChainKey, Arc<ChainProvider>>,
    /// Extra attempts for idempotent reads
    read_retries: u32,
    retry_delay: Duration,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub fn new(settings: &Settings) -> EngineResult<Self> {
        let providers = DashMap::new();

        for (chain, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} (ID: {})", chain, chain_config.chain_id);

            let provider =
                ChainProvider::new(chain, chain_config.clone(), settings.request_timeout())?;
            providers.insert(chain, Arc::new(provider));
        }

        Ok(Self {
            providers,
            read_retries: settings.engine.read_retries,
            retry_delay: Duration::from_millis(settings.engine.retry_delay_ms),
        })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain: ChainKey) -> EngineResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain)
            .map(|p| p.clone())
            .ok_or(EngineError::ChainNotFound { chain })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainKey, bool)> {
        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        let checks = providers.iter().map(|provider| async move {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.chain(), healthy);
            (provider.chain(), healthy)
        });

        let mut results = futures::future::join_all(checks).await;
        results.sort_by_key(|(chain, _)| *chain);
        results
    }

    /// Get all connected chains
    pub fn connected_chains(&self) -> Vec<ChainKey> {
        let mut chains: Vec<_> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort();
        chains
    }

    /// Retry an idempotent read on retryable failures
    async fn with_read_retry<T, F, Fut>(&self, op: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.read_retries => {
                    attempt += 1;
                    debug!("Retrying read after error: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    async fn call_uint(&self, chain: ChainKey, to: Address, data: Bytes) -> EngineResult<U256> {
        let provider = self.get_provider(chain)?;
        let output = self
            .with_read_retry(|| provider.call(to, data.clone()))
            .await?;
        decode_uint(&output)
    }
}

#[async_trait]
impl ChainReader for ChainManager {
    async fn balance_of(
        &self,
        chain: ChainKey,
        location: AssetLocation,
        owner: Address,
    ) -> EngineResult<U256> {
        match location {
            AssetLocation::Native => {
                let provider = self.get_provider(chain)?;
                self.with_read_retry(|| provider.native_balance(owner)).await
            }
            AssetLocation::Token(token) => {
                self.call_uint(chain, token, calldata(erc20::BalanceOfCall { owner }))
                    .await
            }
        }
    }

    async fn allowance(
        &self,
        chain: ChainKey,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> EngineResult<U256> {
        self.call_uint(chain, token, calldata(erc20::AllowanceCall { owner, spender }))
            .await
    }

    async fn vault_assets(
        &self,
        chain: ChainKey,
        vault: Address,
        owner: Address,
    ) -> EngineResult<U256> {
        let shares = self
            .call_uint(chain, vault, calldata(vault_abi::BalanceOfCall { owner }))
            .await?;
        if shares.is_zero() {
            return Ok(U256::zero());
        }
        self.call_uint(chain, vault, calldata(vault_abi::ConvertToAssetsCall { shares }))
            .await
    }

    async fn vault_shares(
        &self,
        chain: ChainKey,
        vault: Address,
        assets: U256,
    ) -> EngineResult<U256> {
        self.call_uint(chain, vault, calldata(vault_abi::ConvertToSharesCall { assets }))
            .await
    }

    async fn simulate(
        &self,
        chain: ChainKey,
        from: Address,
        call: &TxCall,
    ) -> EngineResult<SimulationResult> {
        let provider = self.get_provider(chain)?;
        let result = provider.simulate(from, call).await?;
        if let SimulationResult::Reverted(reason) = &result {
            warn!("Simulation on {} reverted: {}", chain, reason);
        }
        Ok(result)
    }
}
