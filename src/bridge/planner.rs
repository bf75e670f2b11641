//! Greedy allocation of a settlement-chain shortfall across source chains

use super::quote::{QuoteClient, QuoteRequest};
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    AssetSymbol, BalanceTable, BridgeLeg, ChainBalance, LegRejection, RejectedLeg, RequestedAmount,
    ResolvedAmount,
};

use ethers::types::{Address, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of planning one shortfall
#[derive(Debug, Clone, Default)]
pub struct BridgePlan {
    /// Legs to execute, in greedy order
    pub legs: Vec<BridgeLeg>,
    /// Candidates that failed pre-validation, with the reason
    pub rejected: Vec<RejectedLeg>,
    /// Source balances left in place because the shortfall was already covered
    pub unused: Vec<ChainBalance>,
}

impl BridgePlan {
    pub fn total(&self) -> U256 {
        self.legs
            .iter()
            .fold(U256::zero(), |acc, leg| acc.saturating_add(leg.amount))
    }
}

fn abs_diff(a: U256, b: U256) -> U256 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Resolve a requested amount against the cross-chain total.
///
/// `Maximum`, and any exact amount within `dust` of the total, become the
/// exact total and are flagged as maximum.
pub fn resolve_amount(
    requested: &RequestedAmount,
    asset: AssetSymbol,
    total: U256,
    dust: U256,
) -> EngineResult<ResolvedAmount> {
    let amount = match requested {
        RequestedAmount::Maximum => {
            if total.is_zero() {
                return Err(EngineError::InsufficientTotalBalance {
                    asset,
                    requested: "maximum".to_string(),
                    available: asset.format_amount(total),
                });
            }
            return Ok(ResolvedAmount {
                amount: total,
                is_maximum: true,
            });
        }
        RequestedAmount::Exact(amount) => asset.parse_amount(amount)?,
    };

    if amount.is_zero() {
        return Err(EngineError::InvalidAmount("amount must be positive".to_string()));
    }

    if abs_diff(amount, total) <= dust {
        return Ok(ResolvedAmount {
            amount: total,
            is_maximum: true,
        });
    }

    if amount > total {
        return Err(EngineError::InsufficientTotalBalance {
            asset,
            requested: asset.format_amount(amount),
            available: asset.format_amount(total),
        });
    }

    Ok(ResolvedAmount {
        amount,
        is_maximum: false,
    })
}

/// Plans bridge legs towards the settlement chain
pub struct BridgePlanner {
    quotes: Arc<dyn QuoteClient>,
    settings: Arc<Settings>,
}

impl BridgePlanner {
    pub fn new(quotes: Arc<dyn QuoteClient>, settings: Arc<Settings>) -> Self {
        Self { quotes, settings }
    }

    /// Cover `shortfall` on the settlement chain from the other chains in
    /// `balances`, largest balance first.
    ///
    /// Native-asset legs are priced before being accepted; a rejected leg's
    /// share falls through to the next chain. In maximum mode every non-dust
    /// source contributes its whole balance.
    pub async fn plan(
        &self,
        account: Address,
        shortfall: U256,
        balances: &BalanceTable,
        is_maximum: bool,
    ) -> EngineResult<BridgePlan> {
        let asset = balances.asset;
        let settlement = self.settings.settlement.chain;
        let dust = self.settings.dust(asset)?;

        let mut candidates: Vec<ChainBalance> = balances
            .balances
            .iter()
            .filter(|b| b.chain != settlement && b.amount > dust)
            .copied()
            .collect();
        // Largest first; ties fall back to chain order so plans are repeatable
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.chain.cmp(&b.chain)));

        let mut plan = BridgePlan::default();
        let mut remaining = shortfall;

        for candidate in candidates {
            let covered = remaining <= dust;

            if covered && !is_maximum {
                if asset.is_native() {
                    let leg = BridgeLeg {
                        source_chain: candidate.chain,
                        asset,
                        amount: candidate.amount,
                    };
                    if let Err(reason) = self.validate(account, &leg).await {
                        self.reject(&mut plan, leg, reason);
                        continue;
                    }
                }
                plan.unused.push(candidate);
                continue;
            }

            let amount = if is_maximum {
                candidate.amount
            } else {
                candidate.amount.min(remaining)
            };
            let leg = BridgeLeg {
                source_chain: candidate.chain,
                asset,
                amount,
            };

            if asset.is_native() {
                if let Err(reason) = self.validate(account, &leg).await {
                    self.reject(&mut plan, leg, reason);
                    continue;
                }
            }

            debug!(
                "Planned leg {} {} from {}",
                asset.format_amount(amount),
                asset,
                leg.source_chain
            );
            remaining = remaining.saturating_sub(amount);
            plan.legs.push(leg);
        }

        if remaining > dust {
            warn!(
                "Bridgeable {} falls {} short of the request ({} rejected legs)",
                asset,
                asset.format_amount(remaining),
                plan.rejected.len()
            );
            return Err(EngineError::InsufficientFeasibleLiquidity {
                asset,
                missing: asset.format_amount(remaining),
                rejected: plan.rejected,
            });
        }

        info!(
            "Bridge plan for {} {}: {} legs, {} rejected, {} unused",
            asset.format_amount(shortfall),
            asset,
            plan.legs.len(),
            plan.rejected.len(),
            plan.unused.len()
        );
        Ok(plan)
    }

    fn reject(&self, plan: &mut BridgePlan, leg: BridgeLeg, reason: LegRejection) {
        let label = match &reason {
            LegRejection::AmountTooLow(_) => "amount_too_low",
            LegRejection::RouteUnsupported => "route_unsupported",
            LegRejection::QuoteFailed(_) => "quote_failed",
        };
        info!(
            "Rejected {} {} from {}: {}",
            leg.asset.format_amount(leg.amount),
            leg.asset,
            leg.source_chain,
            reason
        );
        crate::metrics::record_leg_rejected(leg.source_chain, label);

        plan.rejected.push(RejectedLeg {
            amount_display: leg.asset.format_amount(leg.amount),
            leg,
            reason,
        });
    }

    /// Price exactly this leg; any failure rejects it
    async fn validate(&self, account: Address, leg: &BridgeLeg) -> Result<(), LegRejection> {
        let request = self
            .quote_request(account, leg)
            .map_err(|_| LegRejection::RouteUnsupported)?;

        match self.quotes.quote(&request).await {
            Ok(_) => Ok(()),
            Err(EngineError::BridgeAmountTooLow { message, .. }) => {
                Err(LegRejection::AmountTooLow(message))
            }
            Err(EngineError::BridgeRouteUnsupported { .. }) => Err(LegRejection::RouteUnsupported),
            Err(e) => Err(LegRejection::QuoteFailed(e.to_string())),
        }
    }

    fn quote_request(&self, account: Address, leg: &BridgeLeg) -> EngineResult<QuoteRequest> {
        let settlement = self.settings.settlement.chain;
        Ok(QuoteRequest {
            origin: leg.source_chain,
            destination: settlement,
            asset: leg.asset,
            input_token: self.settings.bridge_token(leg.source_chain, leg.asset)?,
            output_token: self.settings.bridge_token(settlement, leg.asset)?,
            amount: leg.amount,
            recipient: account,
        })
    }
}
