//! Quorum - multi-agent portfolio coordination
//!
//! Analysts publish signals on the bus, the manager aggregates them into weighted
//! allocations, the trader executes them and the risk agent can halt it all.

pub mod adapters;
pub mod agents;
pub mod bus;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod persistence;
pub mod runtime;

pub use config::AppConfig;
pub use error::{QuorumError, Result};
