use crate::domain::money::Currency;
use crate::domain::payment::PaymentStatus;
use crate::domain::{LoanId, RecordId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid loan terms: {0}")]
    InvalidTerms(String),
    #[error("Schedule conflict on loan {loan_id}: settled payments {payment_numbers:?} fall outside the new schedule")]
    ScheduleConflict {
        loan_id: LoanId,
        payment_numbers: Vec<u32>,
    },
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("Currency mismatch: loan is in {expected}, payment is in {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),
    #[error("Loan not found: {0}")]
    LoanNotFound(LoanId),
    #[error("Payment record not found: {0}")]
    RecordNotFound(RecordId),
    #[error("Loan {loan_id} has no schedule entry #{payment_number}")]
    EntryNotFound { loan_id: LoanId, payment_number: u32 },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Loan {loan_id} changed concurrently; version {version} is stale")]
    VersionConflict { loan_id: LoanId, version: u64 },
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        EngineError::Internal(Box::new(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
