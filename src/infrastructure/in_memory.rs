use crate::domain::loan::LoanBook;
use crate::domain::payment::PaymentStatus;
use crate::domain::ports::LedgerStore;
use crate::domain::{LoanId, RecordId};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    books: HashMap<LoanId, LoanBook>,
    record_index: HashMap<RecordId, LoanId>,
}

/// A thread-safe in-memory ledger store.
///
/// Books and the record index live behind a single `RwLock`, so a commit
/// updates both or neither. Clones share the same tables.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn commit(&self, book: LoanBook) -> Result<()> {
        let mut tables = self.tables.write().await;
        let loan_id = book.loan.id;
        book.ensure_succeeds(tables.books.get(&loan_id))?;
        for record in &book.records {
            tables.record_index.insert(record.id, loan_id);
        }
        tables.books.insert(loan_id, book);
        Ok(())
    }

    async fn get(&self, loan_id: LoanId) -> Result<Option<LoanBook>> {
        let tables = self.tables.read().await;
        Ok(tables.books.get(&loan_id).cloned())
    }

    async fn loan_ids(&self) -> Result<Vec<LoanId>> {
        let tables = self.tables.read().await;
        let mut ids: Vec<LoanId> = tables.books.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn locate(&self, record_id: RecordId) -> Result<Option<LoanId>> {
        let tables = self.tables.read().await;
        Ok(tables.record_index.get(&record_id).copied())
    }

    async fn claim(
        &self,
        loan_id: LoanId,
        record_id: RecordId,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(book) = tables.books.get_mut(&loan_id) else {
            return Ok(false);
        };
        let Some(record) = book.record_mut(record_id) else {
            return Ok(false);
        };
        if record.status != expected {
            return Ok(false);
        }
        record.status = next;
        book.version += 1;
        Ok(true)
    }
}
