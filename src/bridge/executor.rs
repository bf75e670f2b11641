//! Submits planned bridge legs on their source chains

use super::quote::{QuoteClient, QuoteRequest};
use crate::chain::ChainReader;
use crate::config::Settings;
use crate::contracts::{calldata, erc20, spoke_pool, weth};
use crate::error::{EngineError, EngineResult};
use crate::tx::AccountSender;
use crate::types::{AssetLocation, BridgeLeg, ChainKey, SubmittedLeg, TxCall};

use ethers::types::{Address, Bytes, H256, U256};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A leg that never reached the bridge
#[derive(Debug)]
pub struct LegFailure {
    pub leg: BridgeLeg,
    pub error: EngineError,
    /// Unwrap that returned the leg's wrapped funds to the native balance
    pub unwound: Option<H256>,
}

/// Per-leg results of executing a plan, in plan order
#[derive(Debug, Default)]
pub struct LegResults {
    pub submitted: Vec<SubmittedLeg>,
    pub failed: Vec<LegFailure>,
}

/// Wraps, approves and deposits one leg at a time
pub struct BridgeExecutor {
    reader: Arc<dyn ChainReader>,
    sender: Arc<dyn AccountSender>,
    quotes: Arc<dyn QuoteClient>,
    settings: Arc<Settings>,
}

impl BridgeExecutor {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        sender: Arc<dyn AccountSender>,
        quotes: Arc<dyn QuoteClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            reader,
            sender,
            quotes,
            settings,
        }
    }

    /// Run every leg. Chains proceed concurrently; legs on the same chain run
    /// one after another.
    pub async fn execute_all(&self, legs: &[BridgeLeg], recipient: Address) -> LegResults {
        let mut by_chain: BTreeMap<ChainKey, Vec<(usize, &BridgeLeg)>> = BTreeMap::new();
        for (index, leg) in legs.iter().enumerate() {
            by_chain.entry(leg.source_chain).or_default().push((index, leg));
        }

        let lanes = by_chain.into_values().map(|lane| async move {
            let mut results = Vec::with_capacity(lane.len());
            for (index, leg) in lane {
                results.push((index, self.execute_leg(leg, recipient).await));
            }
            results
        });

        let mut outcomes: Vec<_> = join_all(lanes).await.into_iter().flatten().collect();
        outcomes.sort_by_key(|(index, _)| *index);

        let mut results = LegResults::default();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(submitted) => results.submitted.push(submitted),
                Err(failure) => results.failed.push(failure),
            }
        }
        results
    }

    /// Quote, re-check, wrap if native, approve if short, then deposit.
    /// A failure after the wrap unwraps the funds again.
    pub async fn execute_leg(&self, leg: &BridgeLeg, recipient: Address) -> Result<SubmittedLeg, LegFailure> {
        let chain = leg.source_chain;
        let mut wrapped = None;
        match self.try_execute_leg(leg, recipient, &mut wrapped).await {
            Ok(submitted) => {
                crate::metrics::record_leg_submitted(chain);
                Ok(submitted)
            }
            Err(error) => {
                error!(
                    "Bridge leg of {} {} from {} failed: {}",
                    leg.asset.format_amount(leg.amount),
                    leg.asset,
                    chain,
                    error
                );
                crate::metrics::record_leg_failed(chain);
                let unwound = match wrapped {
                    Some(token) => self.unwind_wrap(leg, token).await,
                    None => None,
                };
                Err(LegFailure {
                    leg: leg.clone(),
                    error,
                    unwound,
                })
            }
        }
    }

    /// Turn a failed leg's wrapped funds back into the native asset
    async fn unwind_wrap(&self, leg: &BridgeLeg, token: Address) -> Option<H256> {
        let chain = leg.source_chain;
        let call = TxCall::new(token, calldata(weth::WithdrawCall { amount: leg.amount }));
        match self.sender.send_transaction(chain, call).await {
            Ok(tx_hash) => {
                warn!(
                    "Unwrapped {} back to native on {} after the leg failed: {:?}",
                    leg.asset.format_amount(leg.amount),
                    chain,
                    tx_hash
                );
                Some(tx_hash)
            }
            Err(e) => {
                error!(
                    "{} {} left wrapped on {}; unwrap failed: {}",
                    leg.asset.format_amount(leg.amount),
                    leg.asset,
                    chain,
                    e
                );
                None
            }
        }
    }

    async fn try_execute_leg(
        &self,
        leg: &BridgeLeg,
        recipient: Address,
        wrapped: &mut Option<Address>,
    ) -> EngineResult<SubmittedLeg> {
        let chain = leg.source_chain;
        let destination = self.settings.settlement.chain;
        if chain == destination {
            return Err(EngineError::Internal(format!(
                "Cannot bridge from the settlement chain {}",
                chain
            )));
        }

        let account = self.sender.address();
        let input_token = self.settings.bridge_token(chain, leg.asset)?;
        let output_token = self.settings.bridge_token(destination, leg.asset)?;
        let spoke_pool = self.settings.spoke_pool(chain)?;

        // Quotes expire quickly; always price the leg again right before use
        let quote = self
            .quotes
            .quote(&QuoteRequest {
                origin: chain,
                destination,
                asset: leg.asset,
                input_token,
                output_token,
                amount: leg.amount,
                recipient,
            })
            .await?;
        if quote.is_expired(chrono::Utc::now().timestamp()) {
            return Err(EngineError::BridgeQuote {
                status: 200,
                message: format!("quote for {} expired at {}", chain, quote.fill_deadline),
            });
        }

        let location = self.settings.asset_location(chain, leg.asset)?;
        let balance = self.reader.balance_of(chain, location, account).await?;
        let balance = self.settings.spendable(location, balance)?;
        if balance < leg.amount {
            return Err(EngineError::InsufficientBalance {
                chain,
                have: leg.asset.format_amount(balance),
                need: leg.asset.format_amount(leg.amount),
            });
        }

        if location == AssetLocation::Native {
            debug!("Wrapping {} on {}", leg.asset.format_amount(leg.amount), chain);
            self.sender
                .send_transaction(
                    chain,
                    TxCall::new(input_token, calldata(weth::DepositCall)).with_value(leg.amount),
                )
                .await?;
            *wrapped = Some(input_token);
        }

        let allowance = self
            .reader
            .allowance(chain, input_token, account, spoke_pool)
            .await?;
        if allowance < leg.amount {
            debug!("Approving bridge contract on {}", chain);
            self.sender
                .send_transaction(
                    chain,
                    TxCall::new(
                        input_token,
                        calldata(erc20::ApproveCall {
                            spender: spoke_pool,
                            amount: U256::MAX,
                        }),
                    ),
                )
                .await?;
        }

        let deposit = spoke_pool::DepositV3Call {
            depositor: account,
            recipient,
            input_token,
            output_token,
            input_amount: leg.amount,
            output_amount: quote.output_amount,
            destination_chain_id: U256::from(destination.chain_id()),
            exclusive_relayer: quote.exclusive_relayer,
            quote_timestamp: quote.quote_timestamp,
            fill_deadline: quote.fill_deadline,
            exclusivity_deadline: quote.exclusivity_deadline,
            message: Bytes::default(),
        };
        let tx_hash = self
            .sender
            .send_transaction(chain, TxCall::new(spoke_pool, calldata(deposit)))
            .await?;

        info!(
            "Bridged {} {} from {} to {} (expect {}): {:?}",
            leg.asset.format_amount(leg.amount),
            leg.asset,
            chain,
            destination,
            leg.asset.format_amount(quote.output_amount),
            tx_hash
        );

        Ok(SubmittedLeg {
            leg: leg.clone(),
            quote,
            tx_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::testing::{FakeChain, FakeQuotes, InjectedFailure, SentKind};
    use crate::types::AssetSymbol;

    fn eth(amount: &str) -> U256 {
        AssetSymbol::Eth.parse_amount(amount).unwrap()
    }

    fn usdc(amount: &str) -> U256 {
        AssetSymbol::Usdc.parse_amount(amount).unwrap()
    }

    fn setup() -> (Arc<Settings>, Arc<FakeChain>, BridgeExecutor) {
        setup_with(sample_settings(), FakeQuotes::new(eth("0.0001"), eth("0.001")))
    }

    fn setup_with(settings: Settings, quotes: FakeQuotes) -> (Arc<Settings>, Arc<FakeChain>, BridgeExecutor) {
        let settings = Arc::new(settings);
        let chain = Arc::new(FakeChain::new(settings.clone()));
        let executor =
            BridgeExecutor::new(chain.clone(), chain.clone(), Arc::new(quotes), settings.clone());
        (settings, chain, executor)
    }

    #[tokio::test]
    async fn test_native_leg_wraps_approves_and_deposits() {
        let (_, chain, executor) = setup();
        let account = chain.account();
        chain.set_balance(ChainKey::Optimism, AssetLocation::Native, account, eth("0.9"));

        let leg = BridgeLeg {
            source_chain: ChainKey::Optimism,
            asset: AssetSymbol::Eth,
            amount: eth("0.7"),
        };
        let submitted = executor.execute_leg(&leg, account).await.unwrap();
        assert_eq!(submitted.quote.output_amount, eth("0.6999"));

        let kinds: Vec<SentKind> = chain.sent_on(ChainKey::Optimism);
        assert_eq!(
            kinds,
            vec![SentKind::Wrap, SentKind::Approve, SentKind::BridgeDeposit]
        );
        assert_eq!(
            chain.native_balance(ChainKey::Optimism, account),
            eth("0.2")
        );
    }

    #[tokio::test]
    async fn test_existing_allowance_skips_approval() {
        let (settings, chain, executor) =
            setup_with(sample_settings(), FakeQuotes::new(usdc("0.5"), usdc("1")));
        let account = chain.account();
        let usdc_token = settings.bridge_token(ChainKey::Base, AssetSymbol::Usdc).unwrap();
        let amount = AssetSymbol::Usdc.parse_amount("110").unwrap();
        chain.set_balance(ChainKey::Base, AssetLocation::Token(usdc_token), account, amount);
        chain.set_allowance(
            ChainKey::Base,
            usdc_token,
            account,
            settings.spoke_pool(ChainKey::Base).unwrap(),
            U256::MAX,
        );

        let leg = BridgeLeg {
            source_chain: ChainKey::Base,
            asset: AssetSymbol::Usdc,
            amount,
        };
        let submitted = executor.execute_leg(&leg, account).await.unwrap();
        assert_eq!(submitted.quote.output_amount, usdc("109.5"));
        assert_eq!(chain.sent_on(ChainKey::Base), vec![SentKind::BridgeDeposit]);
    }

    #[tokio::test]
    async fn test_failed_deposit_unwraps_native_funds() {
        let (settings, chain, executor) = setup();
        let account = chain.account();
        let weth = settings.wrapped_native(ChainKey::Optimism).unwrap();
        chain.set_balance(ChainKey::Optimism, AssetLocation::Native, account, eth("1"));
        chain.allow_next_send(ChainKey::Optimism);
        chain.fail_next_send(ChainKey::Optimism, InjectedFailure::Revert);

        let leg = BridgeLeg {
            source_chain: ChainKey::Optimism,
            asset: AssetSymbol::Eth,
            amount: eth("1"),
        };
        let failure = executor.execute_leg(&leg, account).await.unwrap_err();

        assert!(matches!(failure.error, EngineError::TransactionReverted { .. }));
        assert!(failure.unwound.is_some());
        assert_eq!(
            chain.sent_on(ChainKey::Optimism),
            vec![SentKind::Wrap, SentKind::Unwrap]
        );
        assert_eq!(chain.native_balance(ChainKey::Optimism, account), eth("1"));
        assert_eq!(
            chain.balance(ChainKey::Optimism, AssetLocation::Token(weth), account),
            U256::zero()
        );
    }

    #[tokio::test]
    async fn test_failure_before_wrap_needs_no_unwind() {
        let (_, chain, executor) = setup();
        let account = chain.account();
        chain.set_balance(ChainKey::Optimism, AssetLocation::Native, account, eth("1"));
        chain.fail_next_send(ChainKey::Optimism, InjectedFailure::Revert);

        let leg = BridgeLeg {
            source_chain: ChainKey::Optimism,
            asset: AssetSymbol::Eth,
            amount: eth("1"),
        };
        let failure = executor.execute_leg(&leg, account).await.unwrap_err();

        assert!(failure.unwound.is_none());
        assert!(chain.sent_on(ChainKey::Optimism).is_empty());
    }

    #[tokio::test]
    async fn test_native_leg_cannot_spend_gas_reserve() {
        let mut settings = sample_settings();
        settings.settlement.native_gas_reserve = "0.001".to_string();
        let (_, chain, executor) = setup_with(settings, FakeQuotes::new(eth("0.0001"), eth("0.001")));
        let account = chain.account();
        chain.set_balance(ChainKey::Base, AssetLocation::Native, account, eth("0.5"));

        let leg = BridgeLeg {
            source_chain: ChainKey::Base,
            asset: AssetSymbol::Eth,
            amount: eth("0.5"),
        };
        let failure = executor.execute_leg(&leg, account).await.unwrap_err();
        assert!(matches!(failure.error, EngineError::InsufficientBalance { .. }));
        assert!(chain.sent_on(ChainKey::Base).is_empty());
    }

    #[tokio::test]
    async fn test_balance_drop_fails_before_any_send() {
        let (_, chain, executor) = setup();
        let account = chain.account();
        chain.set_balance(ChainKey::Base, AssetLocation::Native, account, eth("0.1"));

        let leg = BridgeLeg {
            source_chain: ChainKey::Base,
            asset: AssetSymbol::Eth,
            amount: eth("0.5"),
        };
        let result = executor.execute_leg(&leg, account).await;
        assert!(matches!(
            result,
            Err(LegFailure {
                error: EngineError::InsufficientBalance { .. },
                ..
            })
        ));
        assert!(chain.sent_on(ChainKey::Base).is_empty());
    }

    #[tokio::test]
    async fn test_failed_chain_does_not_stop_others() {
        let (_, chain, executor) = setup();
        let account = chain.account();
        chain.set_balance(ChainKey::Base, AssetLocation::Native, account, eth("0.5"));
        chain.set_balance(ChainKey::Optimism, AssetLocation::Native, account, eth("0.5"));

        let legs = vec![
            BridgeLeg {
                source_chain: ChainKey::Optimism,
                asset: AssetSymbol::Eth,
                amount: eth("0.5"),
            },
            BridgeLeg {
                source_chain: ChainKey::Base,
                asset: AssetSymbol::Eth,
                amount: eth("0.0005"),
            },
        ];
        let results = executor.execute_all(&legs, account).await;

        assert_eq!(results.submitted.len(), 1);
        assert_eq!(results.submitted[0].leg.source_chain, ChainKey::Optimism);
        assert_eq!(results.failed.len(), 1);
        assert!(matches!(
            results.failed[0].error,
            EngineError::BridgeAmountTooLow { .. }
        ));
        // A leg that fails its quote never reaches the chain
        assert!(chain.sent_on(ChainKey::Base).is_empty());
    }
}
