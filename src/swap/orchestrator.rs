//! Same-chain swaps through the aggregator's router

use super::client::{SwapApi, SwapQuote, SwapQuoteRequest};
use crate::chain::{ChainReader, SimulationResult};
use crate::config::Settings;
use crate::contracts::{calldata, erc20};
use crate::error::{EngineError, EngineResult};
use crate::tx::AccountSender;
use crate::types::{AssetLocation, AssetSymbol, ChainKey, TxCall};

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub chain: ChainKey,
    pub input: AssetSymbol,
    pub output: AssetSymbol,
    /// Human-readable amount of `input`
    pub amount: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwapExecution {
    pub quote: SwapQuote,
    pub approval_tx: Option<H256>,
    pub tx_hash: H256,
    /// Set when the dry-run could not estimate gas and the fallback limit was used
    pub used_fallback_gas: bool,
}

pub struct SwapOrchestrator {
    api: Arc<dyn SwapApi>,
    reader: Arc<dyn ChainReader>,
    sender: Arc<dyn AccountSender>,
    settings: Arc<Settings>,
}

impl SwapOrchestrator {
    pub fn new(
        api: Arc<dyn SwapApi>,
        reader: Arc<dyn ChainReader>,
        sender: Arc<dyn AccountSender>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            api,
            reader,
            sender,
            settings,
        }
    }

    fn token(&self, chain: ChainKey, asset: AssetSymbol) -> EngineResult<Address> {
        // The router takes the zero address for the native asset
        Ok(match self.settings.asset_location(chain, asset)? {
            AssetLocation::Native => Address::zero(),
            AssetLocation::Token(token) => token,
        })
    }

    fn quote_request(&self, request: &SwapRequest) -> EngineResult<SwapQuoteRequest> {
        if request.input == request.output {
            return Err(EngineError::InvalidAmount(format!(
                "cannot swap {} for itself",
                request.input
            )));
        }
        let amount = request.input.parse_amount(&request.amount)?;
        if amount.is_zero() {
            return Err(EngineError::InvalidAmount("amount must be positive".to_string()));
        }

        Ok(SwapQuoteRequest {
            chain_id: self.settings.chain(request.chain)?.chain_id,
            input_token: self.token(request.chain, request.input)?,
            output_token: self.token(request.chain, request.output)?,
            amount,
            user: self.sender.address(),
        })
    }

    pub async fn get_quote(&self, request: &SwapRequest) -> EngineResult<SwapQuote> {
        let quote_request = self.quote_request(request)?;
        self.api.quote(&quote_request).await
    }

    /// Quote, approve the router if needed, assemble, dry-run, then send.
    ///
    /// A dry-run revert aborts before the swap is sent. A dry-run that only
    /// failed to estimate gas proceeds with the configured fallback limit.
    pub async fn execute(&self, request: &SwapRequest) -> EngineResult<SwapExecution> {
        let result = self.try_execute(request).await;
        match &result {
            Ok(_) => crate::metrics::record_swap("executed"),
            Err(EngineError::SimulationReverted { .. }) => crate::metrics::record_swap("reverted"),
            Err(_) => crate::metrics::record_swap("failed"),
        }
        result
    }

    async fn try_execute(&self, request: &SwapRequest) -> EngineResult<SwapExecution> {
        let chain = request.chain;
        let account = self.sender.address();
        let quote_request = self.quote_request(request)?;
        let quote = self.api.quote(&quote_request).await?;

        let approval_tx = match self.settings.asset_location(chain, request.input)? {
            AssetLocation::Native => None,
            AssetLocation::Token(token) => {
                self.approve_router(chain, token, account, quote.in_amount)
                    .await?
            }
        };

        let assembled = self.api.assemble(account, &quote.path_id).await?;
        let simulation = match assembled.simulation {
            Some(result) => result,
            None => self.reader.simulate(chain, account, &assembled.call).await?,
        };

        let mut call = assembled.call;
        let mut used_fallback_gas = false;
        match simulation {
            SimulationResult::Success { .. } => {}
            SimulationResult::GasEstimationFailed(reason) => {
                warn!(
                    "Swap gas estimation failed on {} ({}); using fallback limit {}",
                    chain, reason, self.settings.swap.fallback_gas_limit
                );
                call = call.with_gas(U256::from(self.settings.swap.fallback_gas_limit));
                used_fallback_gas = true;
            }
            SimulationResult::Reverted(reason) => {
                warn!("Swap on {} would revert: {}", chain, reason);
                return Err(EngineError::SimulationReverted { reason });
            }
        }

        let tx_hash = self.sender.send_transaction(chain, call).await?;
        info!(
            "Swapped {} {} for ~{} {} on {}: {:?}",
            request.input.format_amount(quote.in_amount),
            request.input,
            request.output.format_amount(quote.out_amount),
            request.output,
            chain,
            tx_hash
        );

        Ok(SwapExecution {
            quote,
            approval_tx,
            tx_hash,
            used_fallback_gas,
        })
    }

    async fn approve_router(
        &self,
        chain: ChainKey,
        token: Address,
        account: Address,
        amount: U256,
    ) -> EngineResult<Option<H256>> {
        let router = self.settings.swap_router(chain)?;
        let allowance = self.reader.allowance(chain, token, account, router).await?;
        if allowance >= amount {
            return Ok(None);
        }

        let call = TxCall::new(
            token,
            calldata(erc20::ApproveCall {
                spender: router,
                amount,
            }),
        );
        Ok(Some(self.sender.send_transaction(chain, call).await?))
    }
}
