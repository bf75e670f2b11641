//! Core data model shared by the planner, executors and orchestrator

use crate::error::{EngineError, EngineResult};

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{format_units, parse_units, ParseUnits};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Supported networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKey {
    Ethereum,
    Arbitrum,
    Base,
    Optimism,
    Linea,
}

impl ChainKey {
    pub const ALL: [ChainKey; 5] = [
        ChainKey::Ethereum,
        ChainKey::Arbitrum,
        ChainKey::Base,
        ChainKey::Optimism,
        ChainKey::Linea,
    ];

    /// EVM chain id
    pub fn chain_id(&self) -> u64 {
        match self {
            ChainKey::Ethereum => 1,
            ChainKey::Arbitrum => 42161,
            ChainKey::Base => 8453,
            ChainKey::Optimism => 10,
            ChainKey::Linea => 59144,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKey::Ethereum => "ethereum",
            ChainKey::Arbitrum => "arbitrum",
            ChainKey::Base => "base",
            ChainKey::Optimism => "optimism",
            ChainKey::Linea => "linea",
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainKey::ALL
            .into_iter()
            .find(|c| c.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| EngineError::Config(format!("Unknown chain: {}", s)))
    }
}

/// Fungible assets the engine moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSymbol {
    Usdc,
    Usdt,
    Eth,
}

impl AssetSymbol {
    pub fn decimals(&self) -> u32 {
        match self {
            AssetSymbol::Usdc | AssetSymbol::Usdt => 6,
            AssetSymbol::Eth => 18,
        }
    }

    /// Native assets have no token contract and must be wrapped before bridging
    pub fn is_native(&self) -> bool {
        matches!(self, AssetSymbol::Eth)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSymbol::Usdc => "usdc",
            AssetSymbol::Usdt => "usdt",
            AssetSymbol::Eth => "eth",
        }
    }

    /// Convert a human decimal string into base units
    pub fn parse_amount(&self, amount: &str) -> EngineResult<U256> {
        match parse_units(amount.trim(), self.decimals())
            .map_err(|e| EngineError::InvalidAmount(format!("{}: {}", amount, e)))?
        {
            ParseUnits::U256(value) => Ok(value),
            ParseUnits::I256(_) => Err(EngineError::InvalidAmount(format!(
                "{}: negative amounts are not allowed",
                amount
            ))),
        }
    }

    /// Render base units as a human decimal string
    pub fn format_amount(&self, amount: U256) -> String {
        format_units(amount, self.decimals()).unwrap_or_else(|_| amount.to_string())
    }
}

impl fmt::Display for AssetSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetSymbol {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usdc" => Ok(AssetSymbol::Usdc),
            "usdt" => Ok(AssetSymbol::Usdt),
            "eth" => Ok(AssetSymbol::Eth),
            other => Err(EngineError::Config(format!("Unknown asset: {}", other))),
        }
    }
}

/// Where an asset lives on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetLocation {
    Native,
    Token(Address),
}

/// Balance snapshot for one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainBalance {
    pub chain: ChainKey,
    pub asset: AssetSymbol,
    pub amount: U256,
}

/// Per-chain balances for one asset, read at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct BalanceTable {
    pub asset: AssetSymbol,
    pub balances: Vec<ChainBalance>,
}

impl BalanceTable {
    pub fn get(&self, chain: ChainKey) -> U256 {
        self.balances
            .iter()
            .find(|b| b.chain == chain)
            .map(|b| b.amount)
            .unwrap_or_default()
    }

    pub fn total(&self) -> U256 {
        self.balances
            .iter()
            .fold(U256::zero(), |acc, b| acc.saturating_add(b.amount))
    }
}

/// One planned transfer from a source chain to the settlement chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeLeg {
    pub source_chain: ChainKey,
    pub asset: AssetSymbol,
    pub amount: U256,
}

/// Bridge fee quote, valid until `fill_deadline`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeQuote {
    pub output_amount: U256,
    pub fee_total: U256,
    pub quote_timestamp: u32,
    pub fill_deadline: u32,
    pub exclusivity_deadline: u32,
    pub exclusive_relayer: Address,
    pub estimated_fill_secs: Option<u64>,
}

impl BridgeQuote {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.fill_deadline != 0 && i64::from(self.fill_deadline) <= now_unix
    }
}

/// Why a candidate leg was kept out of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LegRejection {
    AmountTooLow(String),
    RouteUnsupported,
    QuoteFailed(String),
}

impl fmt::Display for LegRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRejection::AmountTooLow(msg) => write!(f, "amount too low to bridge ({})", msg),
            LegRejection::RouteUnsupported => f.write_str("no bridge route"),
            LegRejection::QuoteFailed(msg) => write!(f, "quote failed ({})", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedLeg {
    pub leg: BridgeLeg,
    pub amount_display: String,
    pub reason: LegRejection,
}

/// A leg whose deposit transaction was accepted on the source chain
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedLeg {
    pub leg: BridgeLeg,
    pub quote: BridgeQuote,
    pub tx_hash: H256,
}

/// A leg whose execution failed before or during submission
#[derive(Debug, Clone, Serialize)]
pub struct FailedLeg {
    pub leg: BridgeLeg,
    pub error: String,
    /// Unwrap sent to undo the leg's wrap, if one happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unwound: Option<H256>,
}

/// Requested amount, before resolution against balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedAmount {
    Exact(String),
    Maximum,
}

/// What the user wants done on the settlement chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementKind {
    Withdraw { to: Address },
    VaultDeposit { vault: String },
    VaultWithdraw { vault: String },
}

impl SettlementKind {
    pub fn label(&self) -> &'static str {
        match self {
            SettlementKind::Withdraw { .. } => "withdraw",
            SettlementKind::VaultDeposit { .. } => "vault_deposit",
            SettlementKind::VaultWithdraw { .. } => "vault_withdraw",
        }
    }
}

/// A single user request; never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    #[serde(flatten)]
    pub kind: SettlementKind,
    pub asset: AssetSymbol,
    pub amount: RequestedAmount,
}

/// Amount resolved to base units before planning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedAmount {
    pub amount: U256,
    pub is_maximum: bool,
}

/// Poller state for one settlement
#[derive(Debug, Clone)]
pub struct PendingArrival {
    pub chain: ChainKey,
    pub asset: AssetSymbol,
    pub location: AssetLocation,
    /// Balance before any bridged funds landed
    pub baseline: U256,
    /// Absolute balance once every leg has landed
    pub expected_amount: U256,
    pub deadline: Instant,
}

impl PendingArrival {
    pub fn incoming(&self) -> U256 {
        self.expected_amount.saturating_sub(self.baseline)
    }
}

/// How a vault's withdrawal entry point is denominated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawMethod {
    /// `withdraw(assets, receiver, owner)`
    Withdraw,
    /// `redeem(shares, receiver, owner)`
    Redeem,
}

/// Vault addresses and entry points, resolved once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultDescriptor {
    pub id: String,
    pub chain: ChainKey,
    pub asset: AssetSymbol,
    pub token: Address,
    pub deposit_contract: Address,
    pub primary: Address,
    pub secondary: Option<Address>,
    pub withdraw_method: WithdrawMethod,
}

/// A call handed to the account layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCall {
    pub to: Address,
    pub data: Bytes,
    pub value: Option<U256>,
    pub gas: Option<U256>,
}

impl TxCall {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: None,
            gas: None,
        }
    }

    pub fn value_transfer(to: Address, value: U256) -> Self {
        Self {
            to,
            data: Bytes::default(),
            value: Some(value),
            gas: None,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_gas(mut self, gas: U256) -> Self {
        self.gas = Some(gas);
        self
    }
}

/// Final state of one settlement execution
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementStatus {
    Settled {
        tx_hashes: Vec<H256>,
        final_tx: H256,
        delivered: U256,
    },
    /// Bridged funds have not shown up yet; they may still be in flight
    AwaitingArrival { observed: U256, expected: U256 },
    /// Polling was abandoned by the caller; submitted legs keep going
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub id: uuid::Uuid,
    pub request: SettlementRequest,
    pub resolved: ResolvedAmount,
    pub bridged: Vec<SubmittedLeg>,
    pub failed: Vec<FailedLeg>,
    pub rejected: Vec<RejectedLeg>,
    pub unused: Vec<ChainBalance>,
    pub status: SettlementStatus,
}
