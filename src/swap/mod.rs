//! Swap module - same-chain asset conversion through a routing aggregator

pub mod client;
pub mod orchestrator;

pub use client::{AssembledSwap, OdosSwapClient, SwapApi, SwapQuote, SwapQuoteRequest};
pub use orchestrator::{SwapExecution, SwapOrchestrator, SwapRequest};
