//! Local-key transaction sender with nonce conflict recovery

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::AccountSender;
use crate::chain::{ChainManager, ChainProvider, GasPrice};
use crate::config::{Settings, WalletConfig};
use crate::error::{EngineError, EngineResult};
use crate::types::{AssetSymbol, ChainKey, TxCall};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::prelude::*;
use ethers::providers::RpcError;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How a rejected submission is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendFailure {
    /// The nonce slot was not consumed; safe to resync and resend
    NonceConflict,
    /// The node already holds this exact signed transaction
    AlreadyKnown,
    InsufficientFunds,
    Other,
}

fn classify_send_error(message: &str) -> SendFailure {
    let message = message.to_ascii_lowercase();
    if message.contains("already known") || message.contains("already imported") {
        SendFailure::AlreadyKnown
    } else if message.contains("nonce too low")
        || message.contains("nonce too high")
        || message.contains("replacement transaction underpriced")
        || message.contains("nonce has already been used")
        || message.contains("invalid nonce")
    {
        SendFailure::NonceConflict
    } else if message.contains("insufficient funds") {
        SendFailure::InsufficientFunds
    } else {
        SendFailure::Other
    }
}

/// Node-side reason for a rejected call, falling back to the transport error
fn rejection_message(e: &ProviderError) -> String {
    RpcError::as_error_response(e)
        .map(|r| r.message.clone())
        .unwrap_or_else(|| e.to_string())
}

/// Run `submit`; on a nonce conflict resync, wait `backoff` and submit once more.
/// This is the only retry of a send; callers surface whatever comes back.
async fn submit_with_resync<T, S, SF, R, RF>(
    chain: ChainKey,
    backoff: Duration,
    mut submit: S,
    mut resync: R,
) -> EngineResult<T>
where
    S: FnMut() -> SF,
    SF: Future<Output = EngineResult<T>>,
    R: FnMut() -> RF,
    RF: Future<Output = EngineResult<()>>,
{
    match submit().await {
        Err(EngineError::NonceConflict { message, .. }) => {
            warn!("Nonce conflict on {} ({}), resyncing and retrying", chain, message);
            resync().await?;
            tokio::time::sleep(backoff).await;
            submit().await
        }
        result => result,
    }
}

/// Transaction sender backed by a local signing key
pub struct TransactionSender {
    chain_manager: Arc<ChainManager>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    /// One lock per chain; held from nonce allocation until the receipt
    send_locks: DashMap<ChainKey, Arc<Mutex<()>>>,
    confirmation_timeout: Duration,
    nonce_retry_backoff: Duration,
}

impl TransactionSender {
    /// Create a sender with the key named in the wallet config
    pub fn new(chain_manager: Arc<ChainManager>, settings: &Settings) -> EngineResult<Self> {
        let wallet = Self::load_wallet(&settings.wallet)?;
        Ok(Self::with_wallet(chain_manager, wallet, settings))
    }

    pub fn with_wallet(
        chain_manager: Arc<ChainManager>,
        wallet: LocalWallet,
        settings: &Settings,
    ) -> Self {
        info!("Transaction sender initialized with wallet: {:?}", wallet.address());

        Self {
            chain_manager,
            nonce_manager: NonceManager::new(wallet.address()),
            gas_estimator: GasEstimator::new(),
            wallet,
            send_locks: DashMap::new(),
            confirmation_timeout: settings.confirmation_timeout(),
            nonce_retry_backoff: settings.nonce_retry_backoff(),
        }
    }

    fn load_wallet(config: &WalletConfig) -> EngineResult<LocalWallet> {
        let key = std::env::var(&config.private_key_env).map_err(|_| {
            EngineError::Wallet(format!(
                "No wallet configured. Set {} to a hex private key",
                config.private_key_env
            ))
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| EngineError::Wallet(format!("Invalid private key: {}", e)))
    }

    fn send_lock(&self, chain: ChainKey) -> Arc<Mutex<()>> {
        self.send_locks
            .entry(chain)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build a typed transaction for the chain's gas pricing model
    fn build_tx(
        &self,
        chain_id: u64,
        call: &TxCall,
        nonce: u64,
        gas_limit: U256,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => {
                let mut tx = TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(call.to)
                    .data(call.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(chain_id);
                if let Some(value) = call.value {
                    tx = tx.value(value);
                }
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(call.to)
                    .data(call.data.clone())
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(chain_id);
                if let Some(value) = call.value {
                    tx = tx.value(value);
                }
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    async fn gas_limit(&self, provider: &ChainProvider, call: &TxCall) -> EngineResult<U256> {
        if let Some(gas) = call.gas {
            return Ok(gas);
        }

        let mut request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(call.to)
            .data(call.data.clone());
        if let Some(value) = call.value {
            request = request.value(value);
        }
        let estimate = provider.estimate_gas(&request.into()).await?;
        Ok(self.gas_estimator.buffered_limit(estimate))
    }

    /// Sign and broadcast once; returns the hash and the nonce it used
    async fn submit(&self, provider: &ChainProvider, call: &TxCall) -> EngineResult<(H256, u64)> {
        let chain = provider.chain();
        let gas_limit = self.gas_limit(provider, call).await?;
        let gas_price = self.gas_estimator.get_gas_price(provider).await?;

        let nonce = self.nonce_manager.get_nonce(chain).await?;
        let tx = self.build_tx(provider.chain_id(), call, nonce, gas_limit, &gas_price);

        let wallet = self.wallet.clone().with_chain_id(provider.chain_id());
        let signature = match wallet.sign_transaction(&tx).await {
            Ok(signature) => signature,
            Err(e) => {
                self.nonce_manager.release_nonce(chain, nonce).await?;
                return Err(EngineError::Wallet(e.to_string()));
            }
        };
        let raw = tx.rlp_signed(&signature);

        let tx_hash = match timeout(SEND_TIMEOUT, provider.send_raw_transaction(raw)).await {
            Ok(Ok(tx_hash)) => tx_hash,
            Ok(Err(e)) => {
                let message = rejection_message(&e);
                let failure = classify_send_error(&message);
                if failure == SendFailure::AlreadyKnown {
                    // Same signed bytes, so the nonce is taken and the hash is ours
                    let tx_hash = tx.hash(&signature);
                    info!(
                        "Transaction {:?} on {} already known to the node (nonce {})",
                        tx_hash, chain, nonce
                    );
                    self.nonce_manager
                        .mark_pending(chain, nonce, &format!("{:?}", tx_hash))
                        .await?;
                    return Ok((tx_hash, nonce));
                }

                self.nonce_manager.release_nonce(chain, nonce).await?;
                crate::metrics::record_tx_failed(chain);

                return Err(match failure {
                    SendFailure::NonceConflict => EngineError::NonceConflict { chain, message },
                    SendFailure::InsufficientFunds => {
                        let need = GasEstimator::calculate_cost(gas_limit, &gas_price)
                            .saturating_add(call.value.unwrap_or_default());
                        let have = provider
                            .native_balance(self.wallet.address())
                            .await
                            .map(|b| AssetSymbol::Eth.format_amount(b))
                            .unwrap_or_else(|_| "unknown".to_string());
                        EngineError::InsufficientBalance {
                            chain,
                            have,
                            need: AssetSymbol::Eth.format_amount(need),
                        }
                    }
                    SendFailure::AlreadyKnown | SendFailure::Other => {
                        EngineError::Transaction(message)
                    }
                });
            }
            Err(_) => {
                // The node may still have accepted it; let the chain decide the next nonce
                warn!("Transaction send timeout on {} (nonce {})", chain, nonce);
                if let Err(e) = self.nonce_manager.sync(provider).await {
                    warn!("Nonce resync on {} failed: {}", chain, e);
                }
                crate::metrics::record_tx_failed(chain);
                return Err(EngineError::Timeout {
                    operation: format!("send transaction on {}", chain),
                });
            }
        };

        self.nonce_manager
            .mark_pending(chain, nonce, &format!("{:?}", tx_hash))
            .await?;
        crate::metrics::record_tx_submitted(chain);
        info!("Transaction sent on {}: {:?} (nonce {})", chain, tx_hash, nonce);

        Ok((tx_hash, nonce))
    }

    /// Poll for the receipt until it appears or the confirmation window closes
    async fn wait_for_receipt(
        &self,
        provider: &ChainProvider,
        tx_hash: H256,
        nonce: u64,
    ) -> EngineResult<H256> {
        let chain = provider.chain();
        let started = Instant::now();

        while started.elapsed() < self.confirmation_timeout {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    self.nonce_manager.confirm_nonce(chain, nonce).await?;
                    if receipt.status == Some(U64::zero()) {
                        error!("Transaction {:?} reverted on {}", tx_hash, chain);
                        crate::metrics::record_tx_failed(chain);
                        return Err(EngineError::TransactionReverted {
                            chain,
                            tx_hash: format!("{:?}", tx_hash),
                        });
                    }
                    crate::metrics::record_tx_confirmed(chain, started.elapsed().as_secs_f64());
                    debug!("Transaction {:?} confirmed on {}", tx_hash, chain);
                    return Ok(tx_hash);
                }
                Ok(None) => {}
                Err(e) => warn!("Receipt lookup for {:?} on {} failed: {}", tx_hash, chain, e),
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }

        Err(EngineError::Timeout {
            operation: format!("receipt of {:?} on {}", tx_hash, chain),
        })
    }
}

#[async_trait]
impl AccountSender for TransactionSender {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn send_transaction(&self, chain: ChainKey, call: TxCall) -> EngineResult<H256> {
        let lock = self.send_lock(chain);
        let _guard = lock.lock().await;

        let provider = self.chain_manager.get_provider(chain)?;
        if !self.nonce_manager.is_initialized(chain) {
            self.nonce_manager.init_chain(&provider).await?;
        }

        let (tx_hash, nonce) = submit_with_resync(
            chain,
            self.nonce_retry_backoff,
            || self.submit(&provider, &call),
            || self.nonce_manager.sync(&provider),
        )
        .await?;

        self.wait_for_receipt(&provider, tx_hash, nonce).await
    }
}
