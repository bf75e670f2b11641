//! Waits for bridged funds to land on the settlement chain

use crate::chain::ChainReader;
use crate::config::Settings;
use crate::contracts::{calldata, weth};
use crate::error::{EngineError, EngineResult};
use crate::tx::AccountSender;
use crate::types::{AssetLocation, AssetSymbol, ChainKey, PendingArrival, TxCall};

use ethers::types::{H256, U256};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Stops an arrival poll when fired; clones share the same signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Terminal state of one arrival poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// The balance reached the arrival threshold
    Confirmed { observed: U256 },
    /// The attempt budget ran out; the relay may still be in flight
    TimedOut { observed: U256 },
    /// The caller stopped waiting
    Cancelled,
}

impl ArrivalOutcome {
    pub fn into_result(self, pending: &PendingArrival) -> EngineResult<U256> {
        match self {
            ArrivalOutcome::Confirmed { observed } => Ok(observed),
            ArrivalOutcome::TimedOut { observed } => Err(EngineError::ArrivalTimeout {
                chain: pending.chain,
                observed: pending.asset.format_amount(observed),
                expected: pending.asset.format_amount(pending.expected_amount),
            }),
            ArrivalOutcome::Cancelled => Err(EngineError::Cancelled),
        }
    }
}

/// Polls the settlement chain balance and runs the follow-up transactions
pub struct ArrivalPoller {
    reader: Arc<dyn ChainReader>,
    sender: Arc<dyn AccountSender>,
    settings: Arc<Settings>,
}

impl ArrivalPoller {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        sender: Arc<dyn AccountSender>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            reader,
            sender,
            settings,
        }
    }

    /// Describe what to wait for, given the balance before bridging
    pub fn pending(
        &self,
        chain: ChainKey,
        asset: AssetSymbol,
        location: AssetLocation,
        baseline: U256,
        incoming: U256,
    ) -> PendingArrival {
        // Each attempt may spend a full read timeout on top of its interval
        let per_attempt = self.settings.poll_interval() + self.settings.request_timeout();
        let budget = per_attempt * self.settings.settlement.max_poll_attempts.max(1);
        PendingArrival {
            chain,
            asset,
            location,
            baseline,
            expected_amount: baseline.saturating_add(incoming),
            deadline: Instant::now() + budget,
        }
    }

    /// Balance at which the funds count as arrived
    pub fn threshold(&self, pending: &PendingArrival) -> U256 {
        let bps = U256::from(self.settings.settlement.arrival_threshold_bps);
        pending.baseline + pending.incoming() * bps / U256::from(10_000u64)
    }

    /// Poll until the threshold is met, the attempt budget or deadline is
    /// spent, or `cancel` fires. Never submits anything.
    pub async fn await_arrival(
        &self,
        pending: &PendingArrival,
        cancel: &CancelSignal,
    ) -> ArrivalOutcome {
        let account = self.sender.address();
        let threshold = self.threshold(pending);
        let interval = self.settings.poll_interval();
        let max_attempts = self.settings.settlement.max_poll_attempts.max(1);
        let started = Instant::now();
        let mut observed = pending.baseline;

        info!(
            "Waiting for {} {} on {} (threshold {})",
            pending.asset.format_amount(pending.incoming()),
            pending.asset,
            pending.chain,
            pending.asset.format_amount(threshold)
        );

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                info!("Arrival poll on {} cancelled", pending.chain);
                return ArrivalOutcome::Cancelled;
            }

            match self
                .reader
                .balance_of(pending.chain, pending.location, account)
                .await
            {
                Ok(balance) => {
                    observed = balance;
                    if balance >= threshold {
                        let elapsed = started.elapsed().as_secs_f64();
                        info!(
                            "Funds arrived on {} after {} polls ({:.1}s)",
                            pending.chain, attempt, elapsed
                        );
                        crate::metrics::record_arrival(pending.chain, elapsed);
                        return ArrivalOutcome::Confirmed { observed: balance };
                    }
                    debug!(
                        "Poll {}/{} on {}: {} of {}",
                        attempt,
                        max_attempts,
                        pending.chain,
                        pending.asset.format_amount(balance),
                        pending.asset.format_amount(threshold)
                    );
                }
                Err(e) => warn!("Arrival poll {} on {} failed: {}", attempt, pending.chain, e),
            }

            if attempt == max_attempts || Instant::now() >= pending.deadline {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Arrival poll on {} cancelled", pending.chain);
                    return ArrivalOutcome::Cancelled;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        warn!(
            "Funds not confirmed on {}: observed {}, expected {}",
            pending.chain,
            pending.asset.format_amount(observed),
            pending.asset.format_amount(pending.expected_amount)
        );
        crate::metrics::record_arrival_timeout(pending.chain);
        ArrivalOutcome::TimedOut { observed }
    }

    /// Unwrap what arrived as the wrapped native token; returns the amount
    pub async fn unwrap_arrived(&self, pending: &PendingArrival, observed: U256) -> EngineResult<U256> {
        let token = match pending.location {
            AssetLocation::Token(token) => token,
            AssetLocation::Native => return Ok(U256::zero()),
        };
        let arrived = observed.saturating_sub(pending.baseline);
        if arrived.is_zero() {
            return Ok(arrived);
        }

        self.forward(pending.chain, async {
            let tx: H256 = self
                .sender
                .send_transaction(
                    pending.chain,
                    TxCall::new(token, calldata(weth::WithdrawCall { amount: arrived })),
                )
                .await?;
            debug!("Unwrapped {} on {}: {:?}", arrived, pending.chain, tx);
            Ok(arrived)
        })
        .await
    }

    /// Run a transaction that consumes arrived funds. The sender already
    /// retried a nonce conflict once, so any failure here is final and becomes
    /// `PostArrivalForwardingFailed`.
    pub async fn forward<T>(
        &self,
        chain: ChainKey,
        op: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        op.await.map_err(|e| {
            warn!("Forwarding on {} failed after arrival: {}", chain, e);
            EngineError::PostArrivalForwardingFailed {
                chain,
                source: Box::new(e),
            }
        })
    }
}
