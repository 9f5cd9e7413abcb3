//! Domain types and the ports the orchestrator talks through.

pub mod feed;
pub mod gateway;
pub mod ledger;
pub mod operation;
pub mod outcome;
pub mod ports;
