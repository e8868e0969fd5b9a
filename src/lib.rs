//! Loan repayment engine: schedule generation, the payment record lifecycle,
//! fee and adjustment calculations, ledger reconciliation and retry
//! scheduling.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
