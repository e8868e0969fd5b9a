//! Outbound events published for external dispatchers (notifications,
//! reminders, audit feeds). The engine never delivers them itself.

use super::ledger::ReconciliationWarning;
use super::payment::PaymentStatus;
use super::{LoanId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    LoanActivated {
        loan_id: LoanId,
        entries: usize,
        at: DateTime<Utc>,
    },
    ScheduleRegenerated {
        loan_id: LoanId,
        entries: usize,
        at: DateTime<Utc>,
    },
    StatusChanged {
        loan_id: LoanId,
        record_id: RecordId,
        payment_number: Option<u32>,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    },
    RecordAdjusted {
        loan_id: LoanId,
        record_id: RecordId,
        actor: String,
        at: DateTime<Utc>,
    },
    ManualCollectionRequired {
        loan_id: LoanId,
        record_id: RecordId,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    BalanceDiverged(ReconciliationWarning),
    LoanRepaid {
        loan_id: LoanId,
        at: DateTime<Utc>,
    },
    LoanCancelled {
        loan_id: LoanId,
        actor: String,
        reason: String,
        at: DateTime<Utc>,
    },
}
