//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{EngineError, EngineResult};
use crate::types::{ChainKey, TxCall};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Outcome of a dry-run of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationResult {
    Success { gas: U256 },
    /// The call would revert on-chain
    Reverted(String),
    /// The node could not produce a gas estimate, but did not report a revert
    GasEstimationFailed(String),
}

/// Node-reported errors are simulation results; transport errors are not
fn classify_simulation_error(chain: ChainKey, e: &ProviderError) -> EngineResult<SimulationResult> {
    match RpcError::as_error_response(e) {
        Some(response) if response.is_revert() => {
            Ok(SimulationResult::Reverted(response.message.clone()))
        }
        Some(response) => Ok(SimulationResult::GasEstimationFailed(
            response.message.clone(),
        )),
        None => Err(EngineError::ChainConnection {
            chain,
            message: e.to_string(),
        }),
    }
}

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain: ChainKey,
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    request_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(chain: ChainKey, config: ChainConfig, request_timeout: Duration) -> EngineResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", chain, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(EngineError::ChainConnection {
                chain,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            request_timeout,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain, next);
    }

    /// Run a read against each provider in turn until one answers
    async fn read_with_failover<T, F, Fut>(&self, what: &str, op: F) -> EngineResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::from("no providers");
        for _ in 0..self.http_providers.len() {
            match timeout(self.request_timeout, op(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!("Failed to {} on {}: {}", what, self.chain, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("Timed out trying to {} on {}", what, self.chain);
                    last_error = format!("{} timed out", what);
                }
            }
            self.failover();
        }

        Err(EngineError::ChainConnection {
            chain: self.chain,
            message: last_error,
        })
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> EngineResult<u64> {
        self.read_with_failover("get block number", |p| async move {
            p.get_block_number().await.map(|b| b.as_u64())
        })
        .await
    }

    /// Native balance of an account
    pub async fn native_balance(&self, owner: Address) -> EngineResult<U256> {
        self.read_with_failover("get balance", |p| async move {
            p.get_balance(owner, None).await
        })
        .await
    }

    /// Read-only contract call
    pub async fn call(&self, to: Address, data: Bytes) -> EngineResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.read_with_failover("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    /// Pending transaction count for an account
    pub async fn get_transaction_count(&self, owner: Address) -> EngineResult<u64> {
        self.read_with_failover("get transaction count", |p| async move {
            p.get_transaction_count(owner, Some(BlockNumber::Pending.into()))
                .await
                .map(|n| n.as_u64())
        })
        .await
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> EngineResult<Option<TransactionReceipt>> {
        self.read_with_failover("get receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| EngineError::GasEstimation(e.to_string()))
    }

    /// Dry-run a call from `from`, separating reverts from estimation noise
    pub async fn simulate(&self, from: Address, call: &TxCall) -> EngineResult<SimulationResult> {
        let mut request = TransactionRequest::new()
            .from(from)
            .to(call.to)
            .data(call.data.clone());
        if let Some(value) = call.value {
            request = request.value(value);
        }
        let tx: TypedTransaction = request.into();

        match timeout(self.request_timeout, self.http().estimate_gas(&tx, None)).await {
            Ok(Ok(gas)) => Ok(SimulationResult::Success { gas }),
            Ok(Err(e)) => classify_simulation_error(self.chain, &e),
            Err(_) => Err(EngineError::Timeout {
                operation: format!("simulation on {}", self.chain),
            }),
        }
    }

    /// Submit a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> EngineResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| EngineError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> EngineResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| EngineError::GasEstimation(e.to_string()))?
            .ok_or_else(|| EngineError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| EngineError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(1_000_000_000u64); // 1 gwei

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee.min(max_fee)))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for {}: {}", self.chain, e);
                false
            }
        }
    }

    pub fn chain(&self) -> ChainKey {
        self.chain
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{HttpClientError, JsonRpcError};

    fn node_error(code: i64, message: &str) -> ProviderError {
        let rpc = JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        };
        ProviderError::JsonRpcClientError(Box::new(HttpClientError::JsonRpcError(rpc)))
    }

    #[test]
    fn test_simulation_errors_are_classified() {
        assert_eq!(
            classify_simulation_error(ChainKey::Base, &node_error(3, "execution reverted: STF"))
                .unwrap(),
            SimulationResult::Reverted("execution reverted: STF".to_string())
        );
        assert_eq!(
            classify_simulation_error(ChainKey::Base, &node_error(-32000, "gas required exceeds allowance"))
                .unwrap(),
            SimulationResult::GasEstimationFailed("gas required exceeds allowance".to_string())
        );
        assert!(matches!(
            classify_simulation_error(
                ChainKey::Base,
                &ProviderError::CustomError("connection refused".to_string())
            ),
            Err(EngineError::ChainConnection { .. })
        ));
    }
}
