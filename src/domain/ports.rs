use super::events::EngineEvent;
use super::loan::LoanBook;
use super::money::Currency;
use super::payment::PaymentStatus;
use super::{LoanId, RecordId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence for loan books. Each `commit` replaces the whole book
/// atomically: either every change in it lands or none does.
///
/// A commit of an existing loan must carry the stored version plus one,
/// otherwise it fails with [`EngineError::VersionConflict`] and nothing is
/// written. A successful `claim` also bumps the stored version.
///
/// [`EngineError::VersionConflict`]: crate::error::EngineError::VersionConflict
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn commit(&self, book: LoanBook) -> Result<()>;
    async fn get(&self, loan_id: LoanId) -> Result<Option<LoanBook>>;
    async fn loan_ids(&self) -> Result<Vec<LoanId>>;
    /// Loan owning a payment record.
    async fn locate(&self, record_id: RecordId) -> Result<Option<LoanId>>;
    /// Moves a record from `expected` to `next` only if it is still in
    /// `expected`. Returns whether this caller won the claim.
    async fn claim(
        &self,
        loan_id: LoanId,
        record_id: RecordId,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<bool>;
}

pub type LedgerStoreBox = Box<dyn LedgerStore>;
pub type LedgerStoreFactory = Box<dyn Fn() -> LedgerStoreBox + Send + Sync>;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Receives outbound events for an external dispatcher.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Decides which currency codes the engine accepts.
pub trait CurrencyRegistry: Send + Sync {
    fn is_supported(&self, currency: &Currency) -> bool;
}
