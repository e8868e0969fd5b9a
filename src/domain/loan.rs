use super::money::Balance;
use super::payment::{PaymentRecord, PaymentStatus};
use super::schedule::ScheduleEntry;
use super::terms::LoanTerms;
use super::{LoanId, RecordId};
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Repaid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub terms: LoanTerms,
    pub activation_date: NaiveDate,
    pub status: LoanStatus,
    pub outstanding_principal: Balance,
    /// Principal plus every unpaid scheduled charge still expected.
    pub total_outstanding: Balance,
    /// Set once a record exhausts its retries.
    pub manual_collection: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    pub fn new(
        id: LoanId,
        terms: LoanTerms,
        activation_date: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        let principal = Balance::new(terms.principal);
        Self {
            id,
            terms,
            activation_date,
            status: LoanStatus::Active,
            outstanding_principal: principal,
            total_outstanding: principal,
            manual_collection: false,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Where a schedule entry stands given the records written against it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryState {
    /// Still owed; `received` counts money already taken by partial records.
    Open { received: Decimal },
    /// Completed or waived.
    Satisfied,
    /// Every record against it was cancelled.
    Cancelled,
}

/// A loan together with its schedule and payment records. This is the unit
/// the store persists atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanBook {
    pub loan: Loan,
    pub schedule: Vec<ScheduleEntry>,
    pub records: Vec<PaymentRecord>,
    /// Bumped by one on every write. A store only accepts the direct
    /// successor of what it holds.
    #[serde(default)]
    pub version: u64,
}

impl LoanBook {
    /// Checks that `self` may replace `stored`.
    pub fn ensure_succeeds(&self, stored: Option<&LoanBook>) -> Result<()> {
        match stored {
            Some(stored) if stored.version.checked_add(1) != Some(self.version) => {
                Err(EngineError::VersionConflict {
                    loan_id: self.loan.id,
                    version: self.version,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn record(&self, id: RecordId) -> Option<&PaymentRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut PaymentRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn entry(&self, payment_number: u32) -> Option<&ScheduleEntry> {
        self.schedule
            .iter()
            .find(|e| e.payment_number == payment_number)
    }

    pub fn records_for_entry(&self, payment_number: u32) -> impl Iterator<Item = &PaymentRecord> {
        self.records
            .iter()
            .filter(move |r| r.payment_number == Some(payment_number))
    }

    pub fn entry_state(&self, payment_number: u32) -> EntryState {
        let mut received = Decimal::ZERO;
        let mut any_live = false;
        for record in self.records_for_entry(payment_number) {
            match record.status {
                PaymentStatus::Completed | PaymentStatus::Waived => return EntryState::Satisfied,
                PaymentStatus::Partial => {
                    received += record.amount_received;
                    any_live = true;
                }
                PaymentStatus::Cancelled => {}
                _ => any_live = true,
            }
        }
        let has_records = self.records_for_entry(payment_number).next().is_some();
        if has_records && !any_live {
            EntryState::Cancelled
        } else {
            EntryState::Open { received }
        }
    }

    /// Entries that carry at least one settled record and are therefore frozen.
    pub fn settled_payment_numbers(&self) -> BTreeSet<u32> {
        self.records
            .iter()
            .filter(|r| r.status.is_settled())
            .filter_map(|r| r.payment_number)
            .collect()
    }

    /// The record still working towards paying an entry, if any.
    pub fn open_record_for_entry(&self, payment_number: u32) -> Option<&PaymentRecord> {
        self.records_for_entry(payment_number)
            .find(|r| r.status.is_open())
    }

    pub fn late_fee_charged_on_entry(&self, payment_number: u32, except: RecordId) -> bool {
        self.records_for_entry(payment_number)
            .filter(|r| r.id != except)
            .any(|r| r.late_fee_amount.is_some_and(|fee| fee > Decimal::ZERO))
    }

    pub fn has_open_entries(&self) -> bool {
        self.schedule
            .iter()
            .any(|e| matches!(self.entry_state(e.payment_number), EntryState::Open { .. }))
    }
}
