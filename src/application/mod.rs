//! Application layer orchestrating the domain calculations.
//!
//! [`engine::RepaymentEngine`] is the primary entry point. It serializes
//! mutations per loan with async locks and commits every change as one
//! ledger replay. [`retry::RetryScheduler`] drives the time-based transitions.

pub mod engine;
pub mod locks;
pub mod retry;
