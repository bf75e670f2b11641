//! Coordination of one settlement request
//!
//! The settlement engine:
//! 1. Reads balances for the asset on every chain
//! 2. Plans bridge legs for the settlement-chain shortfall
//! 3. Submits the legs and waits for the funds to land
//! 4. Runs the requested action on the settlement chain

pub mod engine;

pub use engine::SettlementEngine;
