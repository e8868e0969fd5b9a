use crate::domain::LoanId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per loan. Mutations on the same loan queue up behind each
/// other; different loans never contend.
#[derive(Debug, Default)]
pub struct LoanLocks {
    locks: Mutex<HashMap<LoanId, Arc<AsyncMutex<()>>>>,
}

impl LoanLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `loan_id`. The guard releases it on drop.
    pub async fn acquire(&self, loan_id: LoanId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(loan_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}
