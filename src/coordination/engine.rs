//! Settlement engine: balances, planning, bridging, arrival and the final action

use crate::bridge::{resolve_amount, BridgeExecutor, BridgePlanner, QuoteClient};
use crate::chain::{BalanceAggregator, ChainReader};
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::settlement::{
    ArrivalOutcome, ArrivalPoller, CancelSignal, SettlementExecutor, SettlementOutcome,
};
use crate::tx::AccountSender;
use crate::types::{
    AssetLocation, AssetSymbol, BalanceTable, ChainBalance, FailedLeg, RejectedLeg,
    ResolvedAmount, SettlementKind, SettlementReport, SettlementRequest, SettlementStatus,
    SubmittedLeg, VaultDescriptor,
};

use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything gathered while bridging, carried into the report
#[derive(Default)]
struct BridgeRun {
    bridged: Vec<SubmittedLeg>,
    failed: Vec<FailedLeg>,
    rejected: Vec<RejectedLeg>,
    unused: Vec<ChainBalance>,
}

/// Runs one settlement request end to end
pub struct SettlementEngine {
    settings: Arc<Settings>,
    reader: Arc<dyn ChainReader>,
    sender: Arc<dyn AccountSender>,
    aggregator: BalanceAggregator,
    planner: BridgePlanner,
    bridges: BridgeExecutor,
    poller: ArrivalPoller,
    executor: SettlementExecutor,
}

impl SettlementEngine {
    pub fn new(
        settings: Arc<Settings>,
        reader: Arc<dyn ChainReader>,
        sender: Arc<dyn AccountSender>,
        quotes: Arc<dyn QuoteClient>,
    ) -> Self {
        Self {
            aggregator: BalanceAggregator::new(reader.clone(), settings.clone()),
            planner: BridgePlanner::new(quotes.clone(), settings.clone()),
            bridges: BridgeExecutor::new(reader.clone(), sender.clone(), quotes, settings.clone()),
            poller: ArrivalPoller::new(reader.clone(), sender.clone(), settings.clone()),
            executor: SettlementExecutor::new(reader.clone(), sender.clone(), settings.clone()),
            settings,
            reader,
            sender,
        }
    }

    /// The account every settlement acts for
    pub fn account(&self) -> Address {
        self.sender.address()
    }

    pub async fn balances(&self, asset: AssetSymbol) -> BalanceTable {
        self.aggregator.get_balances(self.account(), asset).await
    }

    /// Execute a request. Cancelling `cancel` stops arrival polling only;
    /// submitted bridge transactions keep going.
    pub async fn settle(
        &self,
        id: Uuid,
        request: SettlementRequest,
        cancel: &CancelSignal,
    ) -> EngineResult<SettlementReport> {
        let kind = request.kind.label();
        info!("Settlement {} started: {} {:?}", id, kind, request.amount);

        let result = self.run(id, request, cancel).await;
        let status = match &result {
            Ok(report) => match report.status {
                SettlementStatus::Settled { .. } => "settled",
                SettlementStatus::AwaitingArrival { .. } => "awaiting_arrival",
                SettlementStatus::Abandoned => "abandoned",
            },
            Err(e) => {
                if e.should_alert() {
                    error!("Settlement {} needs attention: {}", id, e);
                } else {
                    warn!("Settlement {} failed: {}", id, e);
                }
                "failed"
            }
        };
        crate::metrics::record_settlement(kind, status);
        result
    }

    async fn run(
        &self,
        id: Uuid,
        request: SettlementRequest,
        cancel: &CancelSignal,
    ) -> EngineResult<SettlementReport> {
        let asset = request.asset;
        let dust = self.settings.dust(asset)?;

        let vault = match &request.kind {
            SettlementKind::Withdraw { .. } => None,
            SettlementKind::VaultDeposit { vault } | SettlementKind::VaultWithdraw { vault } => {
                let vault = self.settings.vault(vault)?;
                if vault.asset != asset {
                    return Err(EngineError::UnsupportedAsset {
                        chain: vault.chain,
                        asset,
                    });
                }
                Some(vault)
            }
        };

        let is_vault_withdraw = matches!(request.kind, SettlementKind::VaultWithdraw { .. });
        if let (true, Some(vault)) = (is_vault_withdraw, &vault) {
            let positions = self.executor.vault_positions(vault).await?;
            let resolved = resolve_amount(&request.amount, asset, positions.total(), dust)?;
            let outcome = self.executor.vault_withdraw(vault, resolved.amount).await?;
            return Ok(settled(id, request, resolved, BridgeRun::default(), outcome, resolved.amount));
        }

        let account = self.account();
        let settlement = self.settings.settlement.chain;
        let balances = self.aggregator.get_balances(account, asset).await;
        let resolved = resolve_amount(&request.amount, asset, balances.total(), dust)?;
        let local = balances.get(settlement);

        let shortfall = resolved.amount.saturating_sub(local);
        if shortfall <= dust {
            let delivered = if resolved.is_maximum {
                local
            } else {
                resolved.amount.min(local)
            };
            debug!(
                "Settlement {} covered on {} without bridging",
                id, settlement
            );
            let outcome = self
                .perform(&request.kind, vault.as_ref(), asset, delivered)
                .await?;
            return Ok(settled(id, request, resolved, BridgeRun::default(), outcome, delivered));
        }

        let plan = self
            .planner
            .plan(account, shortfall, &balances, resolved.is_maximum)
            .await?;

        // Bridged funds always land as the token, wrapped for the native asset
        let arrival_location =
            AssetLocation::Token(self.settings.bridge_token(settlement, asset)?);
        let baseline = self
            .reader
            .balance_of(settlement, arrival_location, account)
            .await?;

        let results = self.bridges.execute_all(&plan.legs, account).await;
        let mut run = BridgeRun {
            bridged: results.submitted,
            failed: Vec::with_capacity(results.failed.len()),
            rejected: plan.rejected,
            unused: plan.unused,
        };

        if !results.failed.is_empty() {
            run.failed = results
                .failed
                .iter()
                .map(|failure| FailedLeg {
                    leg: failure.leg.clone(),
                    error: failure.error.to_string(),
                    unwound: failure.unwound,
                })
                .collect();

            let submitted = run
                .bridged
                .iter()
                .fold(U256::zero(), |acc, s| acc.saturating_add(s.leg.amount));
            let still_covered = !resolved.is_maximum
                && local.saturating_add(submitted).saturating_add(dust) >= resolved.amount;

            if !still_covered {
                let first = results
                    .failed
                    .into_iter()
                    .next()
                    .map(|failure| failure.error)
                    .ok_or_else(|| EngineError::Internal("failed leg without error".to_string()))?;
                if run.bridged.is_empty() {
                    return Err(first);
                }
                return Err(EngineError::PartialCompletion {
                    bridged: run.bridged,
                    failed: run.failed,
                    source: Box::new(first),
                });
            }
            warn!(
                "Settlement {}: {} leg(s) failed but submitted legs still cover the request",
                id,
                run.failed.len()
            );
        }

        let incoming = run
            .bridged
            .iter()
            .fold(U256::zero(), |acc, s| acc.saturating_add(s.quote.output_amount));
        let pending = self
            .poller
            .pending(settlement, asset, arrival_location, baseline, incoming);

        let observed = match self.poller.await_arrival(&pending, cancel).await {
            ArrivalOutcome::Confirmed { observed } => observed,
            ArrivalOutcome::TimedOut { observed } => {
                return Ok(report(
                    id,
                    request,
                    resolved,
                    run,
                    SettlementStatus::AwaitingArrival {
                        observed,
                        expected: pending.expected_amount,
                    },
                ));
            }
            ArrivalOutcome::Cancelled => {
                info!("Settlement {} abandoned while waiting for arrival", id);
                return Ok(report(id, request, resolved, run, SettlementStatus::Abandoned));
            }
        };

        let location = self.settings.asset_location(settlement, asset)?;
        if location == AssetLocation::Native {
            self.poller.unwrap_arrived(&pending, observed).await?;
        }

        let available = self.reader.balance_of(settlement, location, account).await?;
        let available = self.settings.spendable(location, available)?;
        let delivered = if resolved.is_maximum {
            available
        } else {
            resolved.amount.min(available)
        };
        if delivered < resolved.amount {
            info!(
                "Settlement {} delivers {} {} of {} requested after bridge fees",
                id,
                asset.format_amount(delivered),
                asset,
                asset.format_amount(resolved.amount)
            );
        }

        let outcome = self
            .poller
            .forward(
                settlement,
                self.perform(&request.kind, vault.as_ref(), asset, delivered),
            )
            .await?;

        Ok(settled(id, request, resolved, run, outcome, delivered))
    }

    /// The user's action on the settlement chain
    async fn perform(
        &self,
        kind: &SettlementKind,
        vault: Option<&VaultDescriptor>,
        asset: AssetSymbol,
        amount: U256,
    ) -> EngineResult<SettlementOutcome> {
        if amount.is_zero() {
            return Err(EngineError::InvalidAmount(
                "nothing left to settle".to_string(),
            ));
        }
        match (kind, vault) {
            (SettlementKind::Withdraw { to }, _) => self.executor.transfer(asset, *to, amount).await,
            (SettlementKind::VaultDeposit { .. }, Some(vault)) => {
                self.executor.vault_deposit(vault, amount).await
            }
            (SettlementKind::VaultWithdraw { .. }, Some(vault)) => {
                self.executor.vault_withdraw(vault, amount).await
            }
            _ => Err(EngineError::Internal(
                "vault settlement without a vault descriptor".to_string(),
            )),
        }
    }
}

fn report(
    id: Uuid,
    request: SettlementRequest,
    resolved: ResolvedAmount,
    run: BridgeRun,
    status: SettlementStatus,
) -> SettlementReport {
    SettlementReport {
        id,
        request,
        resolved,
        bridged: run.bridged,
        failed: run.failed,
        rejected: run.rejected,
        unused: run.unused,
        status,
    }
}

fn settled(
    id: Uuid,
    request: SettlementRequest,
    resolved: ResolvedAmount,
    run: BridgeRun,
    outcome: SettlementOutcome,
    delivered: U256,
) -> SettlementReport {
    info!(
        "Settlement {} complete: {} transaction(s), final {:?}",
        id,
        outcome.tx_hashes.len(),
        outcome.final_tx
    );
    report(
        id,
        request,
        resolved,
        run,
        SettlementStatus::Settled {
            tx_hashes: outcome.tx_hashes,
            final_tx: outcome.final_tx,
            delivered,
        },
    )
}
