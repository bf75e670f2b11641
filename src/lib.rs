//! Multi-chain liquidity consolidation and settlement engine
//!
//! Gathers an asset scattered across several EVM chains onto one settlement
//! chain through a relay bridge, waits for it to land, then withdraws it,
//! deposits it into a vault, or withdraws from a vault. Same-chain swaps run
//! through a routing aggregator.

pub mod api;
pub mod bridge;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod settlement;
pub mod swap;
pub mod tx;
pub mod types;

#[cfg(test)]
mod testing;

pub use coordination::SettlementEngine;
pub use error::{EngineError, EngineResult};
