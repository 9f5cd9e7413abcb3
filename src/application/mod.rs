//! Application layer: confirmation sessions and the payment flows built on them.
//!
//! `ConfirmationOrchestrator` resolves one pending operation by racing the change
//! feed, a gateway poll and a deadline inside a `ConfirmationSession`. `PaymentFlow`
//! wraps it with push initiation and the ledger completion actions.

pub mod completion;
pub mod flow;
pub mod orchestrator;
pub mod poller;
pub mod session;
