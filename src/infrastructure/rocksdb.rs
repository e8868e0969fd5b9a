use crate::domain::loan::LoanBook;
use crate::domain::payment::PaymentStatus;
use crate::domain::ports::LedgerStore;
use crate::domain::{LoanId, RecordId};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for storing loan books.
pub const CF_BOOKS: &str = "books";
/// Column Family mapping payment record ids to their loan.
pub const CF_RECORD_INDEX: &str = "record_index";

/// A persistent ledger store using RocksDB.
///
/// Each commit writes the book and its record index entries in one
/// `WriteBatch`, so a crash never leaves a half-written loan. Clones share the
/// underlying `Arc<DB>` and the write lock.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating the
    /// column families if they are missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_books = ColumnFamilyDescriptor::new(CF_BOOKS, Options::default());
        let cf_index = ColumnFamilyDescriptor::new(CF_RECORD_INDEX, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_books, cf_index])?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::Internal(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn read_book(&self, loan_id: LoanId) -> Result<Option<LoanBook>> {
        let cf = self.cf(CF_BOOKS)?;
        match self.db.get_cf(cf, loan_id.0.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_book(&self, book: &LoanBook) -> Result<()> {
        let books = self.cf(CF_BOOKS)?;
        let index = self.cf(CF_RECORD_INDEX)?;
        let loan_key = book.loan.id.0.as_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(books, loan_key, serde_json::to_vec(book)?);
        for record in &book.records {
            batch.put_cf(index, record.id.0.as_bytes(), loan_key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

fn uuid_from(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| EngineError::Internal(Box::new(e)))
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn commit(&self, book: LoanBook) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        book.ensure_succeeds(self.read_book(book.loan.id)?.as_ref())?;
        self.write_book(&book)
    }

    async fn get(&self, loan_id: LoanId) -> Result<Option<LoanBook>> {
        self.read_book(loan_id)
    }

    async fn loan_ids(&self) -> Result<Vec<LoanId>> {
        let cf = self.cf(CF_BOOKS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _value) = item?;
            ids.push(LoanId(uuid_from(&key)?));
        }
        Ok(ids)
    }

    async fn locate(&self, record_id: RecordId) -> Result<Option<LoanId>> {
        let cf = self.cf(CF_RECORD_INDEX)?;
        match self.db.get_pinned_cf(cf, record_id.0.as_bytes())? {
            Some(bytes) => Ok(Some(LoanId(uuid_from(&bytes)?))),
            None => Ok(None),
        }
    }

    async fn claim(
        &self,
        loan_id: LoanId,
        record_id: RecordId,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<bool> {
        // RocksDB has no compare-and-set; the lock makes read-check-write atomic
        // for every handle sharing this store. Commits take it too.
        let _guard = self.write_lock.lock().await;
        let Some(mut book) = self.read_book(loan_id)? else {
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
        self.write_book(&book)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::loan::Loan;
    use crate::domain::payment::PaymentRecord;
    use crate::domain::schedule::generate;
    use crate::domain::terms::fixtures::monthly_terms;
    use chrono::{NaiveDate, Utc};
    use tempfile::tempdir;

    fn book() -> LoanBook {
        let id = LoanId::generate();
        let activation = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let schedule = generate(id, &monthly_terms(), activation, &EngineConfig::default()).unwrap();
        let now = Utc::now();
        let records = schedule
            .iter()
            .map(|e| PaymentRecord::from_entry(e, now))
            .collect();
        LoanBook {
            loan: Loan::new(id, monthly_terms(), activation, now),
            schedule,
            records,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        assert!(store.db.cf_handle(CF_BOOKS).is_some());
        assert!(store.db.cf_handle(CF_RECORD_INDEX).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_commit_and_locate() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let book = book();

        store.commit(book.clone()).await.unwrap();

        let retrieved = store.get(book.loan.id).await.unwrap().unwrap();
        assert_eq!(retrieved, book);
        assert_eq!(store.loan_ids().await.unwrap(), vec![book.loan.id]);
        assert_eq!(
            store.locate(book.records[2].id).await.unwrap(),
            Some(book.loan.id)
        );
        assert!(store.get(LoanId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_claim() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let book = book();
        store.commit(book.clone()).await.unwrap();
        let id = book.records[0].id;

        assert!(
            store
                .claim(book.loan.id, id, PaymentStatus::Scheduled, PaymentStatus::Due)
                .await
                .unwrap()
        );
        assert!(
            !store
                .claim(book.loan.id, id, PaymentStatus::Scheduled, PaymentStatus::Due)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_rocksdb_rejects_stale_commit() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let book = book();
        store.commit(book.clone()).await.unwrap();

        let mut next = book.clone();
        next.version = 1;
        store.commit(next.clone()).await.unwrap();
        assert!(matches!(
            store.commit(next).await,
            Err(EngineError::VersionConflict { version: 1, .. })
        ));
        assert_eq!(store.get(book.loan.id).await.unwrap().unwrap().version, 1);
    }
}
