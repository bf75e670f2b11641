//! Settlement module - arrival polling and the final settlement actions

pub mod arrival;
pub mod executor;

pub use arrival::{ArrivalOutcome, ArrivalPoller, CancelSignal};
pub use executor::{
    split_vault_withdrawal, SettlementExecutor, SettlementOutcome, VaultLeg, VaultPositions,
};
