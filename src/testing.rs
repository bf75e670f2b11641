//! In-memory chain and bridge doubles for unit tests
//!
//! `FakeChain` keeps a ledger of balances, allowances and vault positions per
//! chain and applies the effects of every call the engine sends, decoding the
//! calldata with the same bindings the engine encodes it with.

use crate::bridge::{QuoteClient, QuoteRequest};
use crate::chain::{ChainReader, SimulationResult};
use crate::config::Settings;
use crate::contracts::{erc20, spoke_pool, vault as vault_abi, weth};
use crate::error::{EngineError, EngineResult};
use crate::tx::AccountSender;
use crate::types::{AssetLocation, BridgeQuote, ChainKey, TxCall};

use async_trait::async_trait;
use ethers::abi::AbiDecode;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// What a sent transaction did, as recognised from its calldata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Wrap,
    Unwrap,
    Approve,
    Transfer,
    NativeTransfer,
    BridgeDeposit,
    VaultDeposit,
    VaultWithdraw,
    VaultRedeem,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    NonceConflict,
    Revert,
}

#[derive(Debug, Clone)]
pub struct SentTx {
    pub chain: ChainKey,
    pub kind: SentKind,
    pub call: TxCall,
    pub hash: H256,
}

type BalanceKey = (ChainKey, AssetLocation, Address);

#[derive(Default)]
struct Ledger {
    balances: HashMap<BalanceKey, U256>,
    allowances: HashMap<(ChainKey, Address, Address, Address), U256>,
    positions: HashMap<(ChainKey, Address, Address), U256>,
    failing_reads: HashSet<ChainKey>,
    reads: HashMap<ChainKey, usize>,
    /// `None` lets one send through before the next queued failure
    injected: HashMap<ChainKey, VecDeque<Option<InjectedFailure>>>,
    sent: Vec<SentTx>,
    tx_counter: u64,
    simulation: Option<SimulationResult>,
    hold_arrivals: bool,
    held: Vec<(BalanceKey, U256)>,
}

impl Ledger {
    fn get(&self, key: &BalanceKey) -> U256 {
        self.balances.get(key).copied().unwrap_or_default()
    }

    fn credit(&mut self, key: BalanceKey, amount: U256) {
        let entry = self.balances.entry(key).or_default();
        *entry = entry.saturating_add(amount);
    }

    fn ensure(&self, key: &BalanceKey, amount: U256, reason: &str) -> Result<(), String> {
        let have = self.get(key);
        if have < amount {
            return Err(format!("{}: have {}, need {}", reason, have, amount));
        }
        Ok(())
    }

    fn debit(&mut self, key: BalanceKey, amount: U256) {
        let entry = self.balances.entry(key).or_default();
        *entry = entry.saturating_sub(amount);
    }

    fn allowance(&self, chain: ChainKey, token: Address, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(chain, token, owner, spender))
            .copied()
            .unwrap_or_default()
    }

    fn consume_allowance(
        &mut self,
        chain: ChainKey,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), String> {
        let current = self.allowance(chain, token, owner, spender);
        if current < amount {
            return Err(format!("allowance {} below {}", current, amount));
        }
        if current != U256::MAX {
            self.allowances
                .insert((chain, token, owner, spender), current - amount);
        }
        Ok(())
    }

    fn position(&self, chain: ChainKey, vault: Address, owner: Address) -> U256 {
        self.positions
            .get(&(chain, vault, owner))
            .copied()
            .unwrap_or_default()
    }
}

/// Single-account chain double implementing both the read and send seams
pub struct FakeChain {
    settings: Arc<Settings>,
    account: Address,
    ledger: Mutex<Ledger>,
}

impl FakeChain {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            account: Address::repeat_byte(0xAA),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }

    pub fn set_balance(&self, chain: ChainKey, location: AssetLocation, owner: Address, amount: U256) {
        self.ledger().balances.insert((chain, location, owner), amount);
    }

    pub fn balance(&self, chain: ChainKey, location: AssetLocation, owner: Address) -> U256 {
        self.ledger().get(&(chain, location, owner))
    }

    pub fn native_balance(&self, chain: ChainKey, owner: Address) -> U256 {
        self.balance(chain, AssetLocation::Native, owner)
    }

    pub fn set_allowance(
        &self,
        chain: ChainKey,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) {
        self.ledger()
            .allowances
            .insert((chain, token, owner, spender), amount);
    }

    pub fn set_vault_position(&self, chain: ChainKey, vault: Address, owner: Address, amount: U256) {
        self.ledger().positions.insert((chain, vault, owner), amount);
    }

    pub fn vault_position(&self, chain: ChainKey, vault: Address, owner: Address) -> U256 {
        self.ledger().position(chain, vault, owner)
    }

    /// Every balance read on `chain` fails from now on
    pub fn fail_reads_on(&self, chain: ChainKey) {
        self.ledger().failing_reads.insert(chain);
    }

    pub fn balance_reads(&self, chain: ChainKey) -> usize {
        self.ledger().reads.get(&chain).copied().unwrap_or_default()
    }

    /// Queue a failure for the next send on `chain`
    pub fn fail_next_send(&self, chain: ChainKey, failure: InjectedFailure) {
        self.ledger()
            .injected
            .entry(chain)
            .or_default()
            .push_back(Some(failure));
    }

    /// Let the next send on `chain` through; queued failures apply after it
    pub fn allow_next_send(&self, chain: ChainKey) {
        self.ledger().injected.entry(chain).or_default().push_back(None);
    }

    pub fn set_simulation(&self, result: SimulationResult) {
        self.ledger().simulation = Some(result);
    }

    /// Keep bridge fills in flight until `release_arrivals`
    pub fn hold_arrivals(&self) {
        self.ledger().hold_arrivals = true;
    }

    pub fn release_arrivals(&self) {
        let mut ledger = self.ledger();
        ledger.hold_arrivals = false;
        let held = std::mem::take(&mut ledger.held);
        for (key, amount) in held {
            ledger.credit(key, amount);
        }
    }

    pub fn sent_on(&self, chain: ChainKey) -> Vec<SentKind> {
        self.sent_txs(chain).into_iter().map(|tx| tx.kind).collect()
    }

    pub fn sent_txs(&self, chain: ChainKey) -> Vec<SentTx> {
        self.ledger()
            .sent
            .iter()
            .filter(|tx| tx.chain == chain)
            .cloned()
            .collect()
    }

    /// Underlying token of whichever configured vault `contract` belongs to
    fn vault_token(&self, contract: Address) -> Option<Address> {
        self.settings.vaults.keys().find_map(|id| {
            let vault = self.settings.vault(id).ok()?;
            let matches = vault.primary == contract
                || vault.deposit_contract == contract
                || vault.secondary == Some(contract);
            matches.then_some(vault.token)
        })
    }

    fn apply(&self, ledger: &mut Ledger, chain: ChainKey, call: &TxCall) -> Result<SentKind, String> {
        let account = self.account;
        let value = call.value.unwrap_or_default();
        let native = (chain, AssetLocation::Native, account);

        if !value.is_zero() {
            ledger.ensure(&native, value, "native balance")?;
        }

        if call.data.is_empty() {
            ledger.debit(native, value);
            ledger.credit((chain, AssetLocation::Native, call.to), value);
            return Ok(SentKind::NativeTransfer);
        }

        let data = call.data.as_ref();
        if weth::DepositCall::decode(data).is_ok() {
            ledger.debit(native, value);
            ledger.credit((chain, AssetLocation::Token(call.to), account), value);
            return Ok(SentKind::Wrap);
        }
        if let Ok(unwrap) = weth::WithdrawCall::decode(data) {
            let wrapped = (chain, AssetLocation::Token(call.to), account);
            ledger.ensure(&wrapped, unwrap.amount, "wrapped balance")?;
            ledger.debit(wrapped, unwrap.amount);
            ledger.credit(native, unwrap.amount);
            return Ok(SentKind::Unwrap);
        }
        if let Ok(approve) = erc20::ApproveCall::decode(data) {
            ledger
                .allowances
                .insert((chain, call.to, account, approve.spender), approve.amount);
            return Ok(SentKind::Approve);
        }
        if let Ok(transfer) = erc20::TransferCall::decode(data) {
            let from = (chain, AssetLocation::Token(call.to), account);
            ledger.ensure(&from, transfer.amount, "token balance")?;
            ledger.debit(from, transfer.amount);
            ledger.credit((chain, AssetLocation::Token(call.to), transfer.to), transfer.amount);
            return Ok(SentKind::Transfer);
        }
        if let Ok(deposit) = spoke_pool::DepositV3Call::decode(data) {
            let input = (chain, AssetLocation::Token(deposit.input_token), account);
            ledger.ensure(&input, deposit.input_amount, "bridge input")?;
            ledger.consume_allowance(
                chain,
                deposit.input_token,
                account,
                call.to,
                deposit.input_amount,
            )?;
            ledger.debit(input, deposit.input_amount);

            let destination = ChainKey::ALL
                .into_iter()
                .find(|c| U256::from(c.chain_id()) == deposit.destination_chain_id)
                .ok_or_else(|| format!("unknown destination {}", deposit.destination_chain_id))?;
            let fill = (
                destination,
                AssetLocation::Token(deposit.output_token),
                deposit.recipient,
            );
            if ledger.hold_arrivals {
                ledger.held.push((fill, deposit.output_amount));
            } else {
                ledger.credit(fill, deposit.output_amount);
            }
            return Ok(SentKind::BridgeDeposit);
        }
        if let Ok(deposit) = vault_abi::DepositCall::decode(data) {
            let token = self
                .vault_token(call.to)
                .ok_or_else(|| format!("{:?} is not a vault", call.to))?;
            let from = (chain, AssetLocation::Token(token), account);
            ledger.ensure(&from, deposit.assets, "vault deposit")?;
            ledger.consume_allowance(chain, token, account, call.to, deposit.assets)?;
            ledger.debit(from, deposit.assets);
            let position = ledger.position(chain, call.to, deposit.receiver);
            ledger
                .positions
                .insert((chain, call.to, deposit.receiver), position + deposit.assets);
            return Ok(SentKind::VaultDeposit);
        }

        // Vault shares are 1:1 with assets here
        let (kind, amount, receiver, owner) =
            if let Ok(withdraw) = vault_abi::WithdrawCall::decode(data) {
                (SentKind::VaultWithdraw, withdraw.assets, withdraw.receiver, withdraw.owner)
            } else if let Ok(redeem) = vault_abi::RedeemCall::decode(data) {
                (SentKind::VaultRedeem, redeem.shares, redeem.receiver, redeem.owner)
            } else {
                return Ok(SentKind::Other);
            };
        let token = self
            .vault_token(call.to)
            .ok_or_else(|| format!("{:?} is not a vault", call.to))?;
        let position = ledger.position(chain, call.to, owner);
        if position < amount {
            return Err(format!("vault position {} below {}", position, amount));
        }
        ledger
            .positions
            .insert((chain, call.to, owner), position - amount);
        ledger.credit((chain, AssetLocation::Token(token), receiver), amount);
        Ok(kind)
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn balance_of(
        &self,
        chain: ChainKey,
        location: AssetLocation,
        owner: Address,
    ) -> EngineResult<U256> {
        let mut ledger = self.ledger();
        *ledger.reads.entry(chain).or_default() += 1;
        if ledger.failing_reads.contains(&chain) {
            return Err(EngineError::ChainConnection {
                chain,
                message: "injected read failure".to_string(),
            });
        }
        Ok(ledger.get(&(chain, location, owner)))
    }

    async fn allowance(
        &self,
        chain: ChainKey,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> EngineResult<U256> {
        Ok(self.ledger().allowance(chain, token, owner, spender))
    }

    async fn vault_assets(&self, chain: ChainKey, vault: Address, owner: Address) -> EngineResult<U256> {
        Ok(self.ledger().position(chain, vault, owner))
    }

    async fn vault_shares(&self, _chain: ChainKey, _vault: Address, assets: U256) -> EngineResult<U256> {
        Ok(assets)
    }

    async fn simulate(
        &self,
        _chain: ChainKey,
        _from: Address,
        call: &TxCall,
    ) -> EngineResult<SimulationResult> {
        Ok(self.ledger().simulation.clone().unwrap_or(SimulationResult::Success {
            gas: call.gas.unwrap_or_else(|| U256::from(21_000)),
        }))
    }
}

#[async_trait]
impl AccountSender for FakeChain {
    fn address(&self) -> Address {
        self.account
    }

    async fn send_transaction(&self, chain: ChainKey, call: TxCall) -> EngineResult<H256> {
        let mut ledger = self.ledger();
        ledger.tx_counter += 1;
        let hash = H256::from_low_u64_be(ledger.tx_counter);

        let injected = ledger
            .injected
            .get_mut(&chain)
            .and_then(|q| q.pop_front())
            .flatten();
        match injected {
            Some(InjectedFailure::NonceConflict) => {
                return Err(EngineError::NonceConflict {
                    chain,
                    message: "nonce too low".to_string(),
                })
            }
            Some(InjectedFailure::Revert) => {
                return Err(EngineError::TransactionReverted {
                    chain,
                    tx_hash: format!("{:?}", hash),
                })
            }
            None => {}
        }

        match self.apply(&mut ledger, chain, &call) {
            Ok(kind) => {
                ledger.sent.push(SentTx {
                    chain,
                    kind,
                    call,
                    hash,
                });
                Ok(hash)
            }
            Err(_) => Err(EngineError::TransactionReverted {
                chain,
                tx_hash: format!("{:?}", hash),
            }),
        }
    }
}

/// Flat-fee bridge quotes with a minimum input amount
pub struct FakeQuotes {
    fee: U256,
    min_amount: U256,
}

impl FakeQuotes {
    pub fn new(fee: U256, min_amount: U256) -> Self {
        Self { fee, min_amount }
    }
}

#[async_trait]
impl QuoteClient for FakeQuotes {
    async fn quote(&self, request: &QuoteRequest) -> EngineResult<BridgeQuote> {
        if request.amount < self.min_amount || request.amount <= self.fee {
            return Err(EngineError::BridgeAmountTooLow {
                chain: request.origin,
                message: format!("minimum deposit is {}", self.min_amount),
            });
        }
        let now = chrono::Utc::now().timestamp() as u32;
        Ok(BridgeQuote {
            output_amount: request.amount - self.fee,
            fee_total: self.fee,
            quote_timestamp: now,
            fill_deadline: now + 4 * 60 * 60,
            exclusivity_deadline: 0,
            exclusive_relayer: Address::zero(),
            estimated_fill_secs: Some(2),
        })
    }
}
