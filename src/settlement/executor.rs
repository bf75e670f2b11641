//! Final actions on the settlement chain: transfer, vault deposit, vault withdraw

use crate::chain::ChainReader;
use crate::config::Settings;
use crate::contracts::{calldata, erc20, vault as vault_abi};
use crate::error::{EngineError, EngineResult};
use crate::tx::AccountSender;
use crate::types::{
    AssetLocation, AssetSymbol, ChainKey, TxCall, VaultDescriptor, WithdrawMethod,
};

use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::{debug, info};

/// Hashes of the transactions that performed one settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub tx_hashes: Vec<H256>,
    /// The last transaction of the batch
    pub final_tx: H256,
}

/// Which of the two vault positions a withdrawal draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultLeg {
    Primary,
    Secondary,
}

/// Position values of a vault descriptor for the account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultPositions {
    pub primary: U256,
    pub secondary: U256,
}

impl VaultPositions {
    pub fn total(&self) -> U256 {
        self.primary.saturating_add(self.secondary)
    }
}

/// Split a withdrawal across the two vault positions.
///
/// A single position is used whenever one can cover the amount on its own,
/// primary first. Otherwise the primary is drained and the secondary covers
/// the rest.
pub fn split_vault_withdrawal(
    positions: VaultPositions,
    amount: U256,
    asset: AssetSymbol,
) -> EngineResult<Vec<(VaultLeg, U256)>> {
    if amount.is_zero() {
        return Err(EngineError::InvalidAmount("amount must be positive".to_string()));
    }
    if positions.primary >= amount {
        return Ok(vec![(VaultLeg::Primary, amount)]);
    }
    if positions.secondary >= amount {
        return Ok(vec![(VaultLeg::Secondary, amount)]);
    }
    if positions.total() < amount {
        return Err(EngineError::InsufficientTotalBalance {
            asset,
            requested: asset.format_amount(amount),
            available: asset.format_amount(positions.total()),
        });
    }

    let mut legs = Vec::with_capacity(2);
    if !positions.primary.is_zero() {
        legs.push((VaultLeg::Primary, positions.primary));
    }
    legs.push((VaultLeg::Secondary, amount - positions.primary));
    Ok(legs)
}

/// Executes the user's requested action once funds are on the settlement chain
pub struct SettlementExecutor {
    reader: Arc<dyn ChainReader>,
    sender: Arc<dyn AccountSender>,
    settings: Arc<Settings>,
}

impl SettlementExecutor {
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

    fn chain(&self) -> ChainKey {
        self.settings.settlement.chain
    }

    /// Send `amount` of `asset` to an external address
    pub async fn transfer(
        &self,
        asset: AssetSymbol,
        to: Address,
        amount: U256,
    ) -> EngineResult<SettlementOutcome> {
        let chain = self.chain();
        let call = match self.settings.asset_location(chain, asset)? {
            AssetLocation::Native => TxCall::value_transfer(to, amount),
            AssetLocation::Token(token) => {
                TxCall::new(token, calldata(erc20::TransferCall { to, amount }))
            }
        };

        info!(
            "Transferring {} {} to {:?} on {}",
            asset.format_amount(amount),
            asset,
            to,
            chain
        );
        self.execute_batch(vec![call]).await
    }

    /// Approve if needed, then deposit into the vault on behalf of the account
    pub async fn vault_deposit(
        &self,
        vault: &VaultDescriptor,
        amount: U256,
    ) -> EngineResult<SettlementOutcome> {
        let account = self.sender.address();
        let allowance = self
            .reader
            .allowance(vault.chain, vault.token, account, vault.deposit_contract)
            .await?;

        let mut calls = Vec::with_capacity(2);
        if allowance < amount {
            debug!("Vault {} needs approval ({} < {})", vault.id, allowance, amount);
            calls.push(TxCall::new(
                vault.token,
                calldata(erc20::ApproveCall {
                    spender: vault.deposit_contract,
                    amount,
                }),
            ));
        }
        calls.push(TxCall::new(
            vault.deposit_contract,
            calldata(vault_abi::DepositCall {
                assets: amount,
                receiver: account,
            }),
        ));

        info!(
            "Depositing {} {} into vault {}",
            vault.asset.format_amount(amount),
            vault.asset,
            vault.id
        );
        self.execute_batch(calls).await
    }

    /// Current asset value of the account's positions in a vault
    pub async fn vault_positions(&self, vault: &VaultDescriptor) -> EngineResult<VaultPositions> {
        let account = self.sender.address();
        let primary = self
            .reader
            .vault_assets(vault.chain, vault.primary, account)
            .await?;
        let secondary = match vault.secondary {
            Some(secondary) => {
                self.reader
                    .vault_assets(vault.chain, secondary, account)
                    .await?
            }
            None => U256::zero(),
        };
        Ok(VaultPositions { primary, secondary })
    }

    /// Withdraw `amount` back to the account, from one or both positions
    pub async fn vault_withdraw(
        &self,
        vault: &VaultDescriptor,
        amount: U256,
    ) -> EngineResult<SettlementOutcome> {
        let positions = self.vault_positions(vault).await?;
        let legs = split_vault_withdrawal(positions, amount, vault.asset)?;

        let mut calls = Vec::with_capacity(legs.len());
        for (leg, assets) in legs {
            let target = match leg {
                VaultLeg::Primary => vault.primary,
                VaultLeg::Secondary => vault.secondary.ok_or_else(|| {
                    EngineError::Internal(format!("Vault {} has no secondary position", vault.id))
                })?,
            };
            calls.push(self.withdraw_call(vault, target, assets).await?);
        }

        info!(
            "Withdrawing {} {} from vault {} in {} transaction(s)",
            vault.asset.format_amount(amount),
            vault.asset,
            vault.id,
            calls.len()
        );
        self.execute_batch(calls).await
    }

    async fn withdraw_call(
        &self,
        vault: &VaultDescriptor,
        target: Address,
        assets: U256,
    ) -> EngineResult<TxCall> {
        let account = self.sender.address();
        let data = match vault.withdraw_method {
            WithdrawMethod::Withdraw => calldata(vault_abi::WithdrawCall {
                assets,
                receiver: account,
                owner: account,
            }),
            WithdrawMethod::Redeem => {
                let shares = self.reader.vault_shares(vault.chain, target, assets).await?;
                calldata(vault_abi::RedeemCall {
                    shares,
                    receiver: account,
                    owner: account,
                })
            }
        };
        Ok(TxCall::new(target, data))
    }

    /// Send calls in order; each waits for the previous one to be mined
    async fn execute_batch(&self, calls: Vec<TxCall>) -> EngineResult<SettlementOutcome> {
        let chain = self.chain();
        let mut tx_hashes = Vec::with_capacity(calls.len());
        for call in calls {
            tx_hashes.push(self.sender.send_transaction(chain, call).await?);
        }

        let final_tx = *tx_hashes
            .last()
            .ok_or_else(|| EngineError::Internal("empty settlement batch".to_string()))?;
        Ok(SettlementOutcome { tx_hashes, final_tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::testing::{FakeChain, SentKind};

    fn usdc(amount: &str) -> U256 {
        AssetSymbol::Usdc.parse_amount(amount).unwrap()
    }

    fn setup(adjust: impl FnOnce(&mut Settings)) -> (Arc<Settings>, Arc<FakeChain>, SettlementExecutor) {
        let mut settings = sample_settings();
        adjust(&mut settings);
        let settings = Arc::new(settings);
        let chain = Arc::new(FakeChain::new(settings.clone()));
        let executor = SettlementExecutor::new(chain.clone(), chain.clone(), settings.clone());
        (settings, chain, executor)
    }

    #[test]
    fn test_split_prefers_single_position() {
        let positions = VaultPositions {
            primary: usdc("100"),
            secondary: usdc("500"),
        };
        assert_eq!(
            split_vault_withdrawal(positions, usdc("80"), AssetSymbol::Usdc).unwrap(),
            vec![(VaultLeg::Primary, usdc("80"))]
        );
        assert_eq!(
            split_vault_withdrawal(positions, usdc("300"), AssetSymbol::Usdc).unwrap(),
            vec![(VaultLeg::Secondary, usdc("300"))]
        );
    }

    #[test]
    fn test_split_drains_primary_then_secondary() {
        let positions = VaultPositions {
            primary: usdc("60"),
            secondary: usdc("50"),
        };
        assert_eq!(
            split_vault_withdrawal(positions, usdc("100"), AssetSymbol::Usdc).unwrap(),
            vec![(VaultLeg::Primary, usdc("60")), (VaultLeg::Secondary, usdc("40"))]
        );
        assert!(matches!(
            split_vault_withdrawal(positions, usdc("111"), AssetSymbol::Usdc),
            Err(EngineError::InsufficientTotalBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_withdraw_from_primary_only() {
        let (settings, chain, executor) = setup(|_| {});
        let vault = settings.vault("stable").unwrap();
        let account = chain.account();
        chain.set_vault_position(vault.chain, vault.primary, account, usdc("200"));
        chain.set_vault_position(vault.chain, vault.secondary.unwrap(), account, usdc("50"));

        let outcome = executor.vault_withdraw(&vault, usdc("150")).await.unwrap();

        assert_eq!(outcome.tx_hashes.len(), 1);
        assert_eq!(outcome.final_tx, outcome.tx_hashes[0]);
        assert_eq!(chain.sent_on(vault.chain), vec![SentKind::VaultWithdraw]);
        assert_eq!(chain.vault_position(vault.chain, vault.primary, account), usdc("50"));
        assert_eq!(
            chain.balance(vault.chain, AssetLocation::Token(vault.token), account),
            usdc("150")
        );
    }

    #[tokio::test]
    async fn test_withdraw_split_across_positions() {
        let (settings, chain, executor) = setup(|_| {});
        let vault = settings.vault("stable").unwrap();
        let secondary = vault.secondary.unwrap();
        let account = chain.account();
        chain.set_vault_position(vault.chain, vault.primary, account, usdc("60"));
        chain.set_vault_position(vault.chain, secondary, account, usdc("90"));

        let outcome = executor.vault_withdraw(&vault, usdc("100")).await.unwrap();

        assert_eq!(outcome.tx_hashes.len(), 2);
        assert_eq!(outcome.final_tx, outcome.tx_hashes[1]);
        assert_eq!(chain.vault_position(vault.chain, vault.primary, account), U256::zero());
        assert_eq!(chain.vault_position(vault.chain, secondary, account), usdc("50"));
        assert_eq!(
            chain.balance(vault.chain, AssetLocation::Token(vault.token), account),
            usdc("100")
        );
    }

    #[tokio::test]
    async fn test_redeem_vault_converts_to_shares() {
        let (settings, chain, executor) = setup(|s| {
            if let Some(vault) = s.vaults.get_mut("stable") {
                vault.withdraw_method = WithdrawMethod::Redeem;
            }
        });
        let vault = settings.vault("stable").unwrap();
        let account = chain.account();
        chain.set_vault_position(vault.chain, vault.primary, account, usdc("10"));

        executor.vault_withdraw(&vault, usdc("10")).await.unwrap();
        assert_eq!(chain.sent_on(vault.chain), vec![SentKind::VaultRedeem]);
    }

    #[tokio::test]
    async fn test_deposit_batches_approval_first() {
        let (settings, chain, executor) = setup(|_| {});
        let vault = settings.vault("stable").unwrap();
        let account = chain.account();
        chain.set_balance(vault.chain, AssetLocation::Token(vault.token), account, usdc("75"));

        let outcome = executor.vault_deposit(&vault, usdc("75")).await.unwrap();
        assert_eq!(outcome.tx_hashes.len(), 2);
        assert_eq!(
            chain.sent_on(vault.chain),
            vec![SentKind::Approve, SentKind::VaultDeposit]
        );
        assert_eq!(chain.vault_position(vault.chain, vault.deposit_contract, account), usdc("75"));

        // Allowance was consumed exactly; a second deposit approves again
        chain.set_balance(vault.chain, AssetLocation::Token(vault.token), account, usdc("5"));
        executor.vault_deposit(&vault, usdc("5")).await.unwrap();
        assert_eq!(chain.sent_on(vault.chain).len(), 4);
    }

    #[tokio::test]
    async fn test_native_transfer_is_plain_value_send() {
        let (_, chain, executor) = setup(|_| {});
        let account = chain.account();
        let to = Address::repeat_byte(0x77);
        let amount = AssetSymbol::Eth.parse_amount("0.5").unwrap();
        chain.set_balance(ChainKey::Arbitrum, AssetLocation::Native, account, amount);

        executor.transfer(AssetSymbol::Eth, to, amount).await.unwrap();
        assert_eq!(chain.sent_on(ChainKey::Arbitrum), vec![SentKind::NativeTransfer]);
        assert_eq!(chain.native_balance(ChainKey::Arbitrum, to), amount);
    }
}
