//! Transaction submission module with nonce management and gas estimation
//!
//! Everything that changes chain state goes through [`AccountSender`]. The
//! production implementation signs locally and serialises sends per chain so
//! that one account never races itself for a nonce.

mod gas;
mod nonce;
mod sender;

pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use sender::TransactionSender;

use crate::error::EngineResult;
use crate::types::{ChainKey, TxCall};

use async_trait::async_trait;
use ethers::types::{Address, H256};

/// The signing account the engine acts as
#[async_trait]
pub trait AccountSender: Send + Sync {
    /// Address that owns the balances and signs every transaction
    fn address(&self) -> Address;

    /// Submit a call and wait until it is mined.
    ///
    /// Calls to the same chain are executed in submission order; the returned
    /// hash belongs to a transaction with a successful receipt.
    async fn send_transaction(&self, chain: ChainKey, call: TxCall) -> EngineResult<H256>;
}
