//! Bridge module - quoting, planning and executing transfers to the settlement chain

pub mod executor;
pub mod planner;
pub mod quote;

pub use executor::{BridgeExecutor, LegFailure, LegResults};
pub use planner::{resolve_amount, BridgePlan, BridgePlanner};
pub use quote::{AcrossQuoteClient, QuoteClient, QuoteRequest};
