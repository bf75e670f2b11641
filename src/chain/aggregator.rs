//! Parallel per-chain balance reads

use super::ChainReader;
use crate::config::Settings;
use crate::types::{AssetSymbol, BalanceTable, ChainBalance, ChainKey};

use ethers::types::{Address, U256};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fans balance reads out over every active chain
pub struct BalanceAggregator {
    reader: Arc<dyn ChainReader>,
    settings: Arc<Settings>,
}

impl BalanceAggregator {
    pub fn new(reader: Arc<dyn ChainReader>, settings: Arc<Settings>) -> Self {
        Self { reader, settings }
    }

    /// Read `asset` for `account` on all enabled chains concurrently.
    ///
    /// Amounts are spendable: the native gas reserve is already deducted.
    /// A chain that cannot be read contributes zero; the error is logged and
    /// counted, never raised. Chains that do not carry the asset are omitted.
    pub async fn get_balances(&self, account: Address, asset: AssetSymbol) -> BalanceTable {
        let chains: Vec<ChainKey> = self
            .settings
            .enabled_chains()
            .into_iter()
            .map(|(chain, _)| chain)
            .collect();

        let reads = chains.into_iter().filter_map(|chain| {
            let location = match self.settings.asset_location(chain, asset) {
                Ok(location) => location,
                Err(e) => {
                    debug!("Skipping {} for {}: {}", chain, asset, e);
                    return None;
                }
            };
            let reserve = match self.settings.gas_reserve(location) {
                Ok(reserve) => reserve,
                Err(e) => {
                    warn!("Skipping {} for {}: {}", chain, asset, e);
                    return None;
                }
            };
            let reader = self.reader.clone();
            Some(async move {
                let amount = match reader.balance_of(chain, location, account).await {
                    Ok(amount) => amount.saturating_sub(reserve),
                    Err(e) => {
                        warn!("Balance read for {} on {} failed, counting zero: {}", asset, chain, e);
                        crate::metrics::record_balance_read_failure(chain);
                        U256::zero()
                    }
                };
                ChainBalance {
                    chain,
                    asset,
                    amount,
                }
            })
        });

        let mut balances = join_all(reads).await;
        balances.sort_by_key(|b| b.chain);

        debug!(
            "Balances for {}: {}",
            asset,
            balances
                .iter()
                .map(|b| format!("{}={}", b.chain, asset.format_amount(b.amount)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        BalanceTable { asset, balances }
    }

    /// Sum of `asset` across all chains
    pub async fn get_total(&self, account: Address, asset: AssetSymbol) -> U256 {
        self.get_balances(account, asset).await.total()
    }
}
