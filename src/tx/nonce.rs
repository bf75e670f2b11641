//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent sends from one account never collide
//! - Resync after the node reports a nonce already in use
//! - Release of nonces whose transaction never reached the mempool

use crate::chain::ChainProvider;
use crate::error::{EngineError, EngineResult};
use crate::types::ChainKey;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
struct ChainNonceState {
    /// Current local nonce (next to use)
    current: u64,
    /// Pending transactions: nonce -> tx_hash
    pending: BTreeMap<u64, String>,
}

/// Manages nonces across multiple chains
pub struct NonceManager {
    /// Wallet address
    wallet_address: Address,
    /// Per-chain nonce state
    chain_state: DashMap<ChainKey, Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Initialize nonce for a chain from on-chain state
    pub async fn init_chain(&self, provider: &ChainProvider) -> EngineResult<()> {
        let on_chain_nonce = self.fetch_nonce(provider).await?;
        self.init_with(provider.chain(), on_chain_nonce);
        Ok(())
    }

    fn init_with(&self, chain: ChainKey, nonce: u64) {
        let state = ChainNonceState {
            current: nonce,
            pending: BTreeMap::new(),
        };
        self.chain_state.insert(chain, Arc::new(Mutex::new(state)));
        debug!("Initialized nonce for {}: {}", chain, nonce);
    }

    pub fn is_initialized(&self, chain: ChainKey) -> bool {
        self.chain_state.contains_key(&chain)
    }

    /// Get the next nonce for a chain
    pub async fn get_nonce(&self, chain: ChainKey) -> EngineResult<u64> {
        let state = self.state(chain)?;
        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for {}", nonce, chain);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, chain: ChainKey, nonce: u64, tx_hash: &str) -> EngineResult<()> {
        let state = self.state(chain)?;
        let mut state = state.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
        Ok(())
    }

    /// Confirm a nonce (transaction mined)
    pub async fn confirm_nonce(&self, chain: ChainKey, nonce: u64) -> EngineResult<()> {
        let state = self.state(chain)?;
        let mut state = state.lock().await;
        state.pending.remove(&nonce);
        Ok(())
    }

    /// Release a nonce (transaction never broadcast, can be reused)
    pub async fn release_nonce(&self, chain: ChainKey, nonce: u64) -> EngineResult<()> {
        let state = self.state(chain)?;
        let mut state = state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed back
        if state.current > 0 && nonce == state.current - 1 {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> EngineResult<()> {
        let chain = provider.chain();
        let on_chain_nonce = self.fetch_nonce(provider).await?;
        self.apply_sync(chain, on_chain_nonce).await
    }

    async fn apply_sync(&self, chain: ChainKey, on_chain_nonce: u64) -> EngineResult<()> {
        let state = self.state(chain)?;
        let mut state = state.lock().await;

        // Everything below the on-chain nonce has been mined
        let still_pending = state.pending.split_off(&on_chain_nonce);
        state.pending = still_pending;

        if state.current < on_chain_nonce {
            warn!(
                "Nonce on {} behind chain: local {}, chain {}",
                chain, state.current, on_chain_nonce
            );
            state.current = on_chain_nonce;
        }

        Ok(())
    }

    pub async fn pending_count(&self, chain: ChainKey) -> usize {
        match self.state(chain) {
            Ok(state) => state.lock().await.pending.len(),
            Err(_) => 0,
        }
    }

    fn state(&self, chain: ChainKey) -> EngineResult<Arc<Mutex<ChainNonceState>>> {
        self.chain_state
            .get(&chain)
            .map(|s| s.clone())
            .ok_or(EngineError::NonceConflict {
                chain,
                message: "Chain not initialized".to_string(),
            })
    }

    /// Fetch nonce from chain
    async fn fetch_nonce(&self, provider: &ChainProvider) -> EngineResult<u64> {
        provider.get_transaction_count(self.wallet_address).await
    }
}
