//! Payment confirmation for a mobile-money token platform.
//!
//! After a push request goes out, [`application::orchestrator::ConfirmationOrchestrator`]
//! turns the noisy signals that follow (webhook writes seen on a change feed,
//! gateway status polls, a deadline) into one terminal outcome per operation and
//! applies the dependent ledger change at most once.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
