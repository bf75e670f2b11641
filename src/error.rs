//! Error types for the settlement engine

use crate::types::{AssetSymbol, ChainKey, FailedLeg, RejectedLeg, SubmittedLeg};

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: ChainKey, message: String },

    #[error("Chain {chain} is not configured")]
    ChainNotFound { chain: ChainKey },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Transaction {tx_hash} reverted on {chain}")]
    TransactionReverted { chain: ChainKey, tx_hash: String },

    #[error("Nonce conflict on {chain}: {message}")]
    NonceConflict { chain: ChainKey, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Requested {requested} {asset} but only {available} is held across all chains")]
    InsufficientTotalBalance {
        asset: AssetSymbol,
        requested: String,
        available: String,
    },

    #[error("{}", format_infeasible(.asset, .missing, .rejected))]
    InsufficientFeasibleLiquidity {
        asset: AssetSymbol,
        missing: String,
        rejected: Vec<RejectedLeg>,
    },

    #[error("No bridge route from {from} to {to} for {asset}")]
    BridgeRouteUnsupported {
        from: ChainKey,
        to: ChainKey,
        asset: AssetSymbol,
    },

    #[error("Amount too low to bridge from {chain}: {message}")]
    BridgeAmountTooLow { chain: ChainKey, message: String },

    #[error("Bridge quote failed ({status}): {message}")]
    BridgeQuote { status: u16, message: String },

    #[error("Funds did not arrive on {chain} in time: observed {observed}, expected {expected}")]
    ArrivalTimeout {
        chain: ChainKey,
        observed: String,
        expected: String,
    },

    #[error("Funds landed on {chain} but forwarding failed: {source}")]
    PostArrivalForwardingFailed {
        chain: ChainKey,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Swap simulation reverted: {reason}")]
    SimulationReverted { reason: String },

    #[error("Swap API error ({status}): {message}")]
    SwapApi { status: u16, message: String },

    #[error("Insufficient balance on {chain}: have {have}, need {need}")]
    InsufficientBalance {
        chain: ChainKey,
        have: String,
        need: String,
    },

    #[error("Vault {0} is not configured")]
    UnknownVault(String),

    #[error("Asset {asset} is not available on {chain}")]
    UnsupportedAsset { chain: ChainKey, asset: AssetSymbol },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{source}")]
    PartialCompletion {
        bridged: Vec<SubmittedLeg>,
        failed: Vec<FailedLeg>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ChainConnection { .. }
                | EngineError::Timeout { .. }
                | EngineError::Http(_)
                | EngineError::NonceConflict { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::PostArrivalForwardingFailed { .. }
                | EngineError::PartialCompletion { .. }
                | EngineError::Wallet(_)
        )
    }

    /// Strip a `PartialCompletion` wrapper down to the error that caused it
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::PartialCompletion { source, .. } => source.root(),
            other => other,
        }
    }
}

fn format_infeasible(asset: &AssetSymbol, missing: &str, rejected: &[RejectedLeg]) -> String {
    let mut message = format!(
        "Not enough bridgeable {} to cover the request ({} short)",
        asset, missing
    );
    for rejection in rejected {
        message.push_str(&format!(
            "; {} on {} could not be used: {}",
            rejection.amount_display, rejection.leg.source_chain, rejection.reason
        ));
    }
    message
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
