use super::money::Currency;
use super::schedule::ScheduleEntry;
use super::{LoanId, RecordId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Scheduled,
    Due,
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Waived,
    Partial,
}

impl PaymentStatus {
    /// No further transition is possible from this state.
    ///
    /// `Partial` closes the record itself while the schedule entry stays open.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Cancelled
                | PaymentStatus::Waived
                | PaymentStatus::Partial
        )
    }

    /// Money has changed hands (or been forgiven) for this record.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Waived | PaymentStatus::Partial
        )
    }

    /// The record still represents an unpaid obligation.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Scheduled => "scheduled",
            PaymentStatus::Due => "due",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Waived => "waived",
            PaymentStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a payment came from. The engine only stores the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum PaymentSource {
    Schedule,
    PaymentMethod(String),
    Transaction(String),
    Manual(String),
}

/// The money-bearing fields of a record at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub principal_amount: Decimal,
    pub interest_amount: Decimal,
    pub fee_amount: Decimal,
    pub late_fee_amount: Option<Decimal>,
    pub early_payment_fee_amount: Decimal,
    pub additional_amount: Decimal,
    pub amount_received: Decimal,
    pub due_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub reason: String,
    pub before: FinancialSnapshot,
    pub after: FinancialSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: RecordId,
    /// Idempotency key for settlement.
    pub reference_number: String,
    pub loan_id: LoanId,
    /// Schedule entry this record pays; `None` for ad hoc prepayments.
    pub payment_number: Option<u32>,
    /// Amount the record is expected to settle, fees excluded.
    pub amount: Decimal,
    pub principal_amount: Decimal,
    pub interest_amount: Decimal,
    pub fee_amount: Decimal,
    /// `None` until evaluated at settlement; reused by every later attempt.
    pub late_fee_amount: Option<Decimal>,
    pub early_payment_fee_amount: Decimal,
    pub additional_amount: Decimal,
    pub amount_received: Decimal,
    pub tendered_amount: Option<Decimal>,
    pub currency: Currency,
    pub due_date: NaiveDate,
    pub payment_date: Option<DateTime<Utc>>,
    pub days_late: u32,
    /// Snapshot of [`PaymentRecord::overdue_as_of`] taken at the last evaluation.
    pub is_overdue: bool,
    pub status: PaymentStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub principal_balance_after: Option<Decimal>,
    pub total_balance_after: Option<Decimal>,
    pub interest_rate_applied: Decimal,
    pub days_in_period: u32,
    pub is_adjusted: bool,
    pub adjustment_history: Vec<AdjustmentEntry>,
    pub source: PaymentSource,
    /// Set on records topping up an entry a partial payment left open.
    pub follow_up_of: Option<RecordId>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// A `scheduled` record mirroring a schedule entry.
    pub fn from_entry(entry: &ScheduleEntry, created_at: DateTime<Utc>) -> Self {
        let id = RecordId::generate();
        Self {
            id,
            reference_number: reference_number(id, created_at),
            loan_id: entry.loan_id,
            payment_number: Some(entry.payment_number),
            amount: entry.total_due(),
            principal_amount: entry.expected_principal,
            interest_amount: entry.expected_interest,
            fee_amount: entry.expected_fee,
            late_fee_amount: None,
            early_payment_fee_amount: Decimal::ZERO,
            additional_amount: Decimal::ZERO,
            amount_received: Decimal::ZERO,
            tendered_amount: None,
            currency: entry.currency.clone(),
            due_date: entry.due_date,
            payment_date: None,
            days_late: 0,
            is_overdue: false,
            status: PaymentStatus::Scheduled,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            principal_balance_after: None,
            total_balance_after: None,
            interest_rate_applied: entry.period_rate,
            days_in_period: entry.days_in_period,
            is_adjusted: false,
            adjustment_history: Vec::new(),
            source: PaymentSource::Schedule,
            follow_up_of: None,
            metadata: BTreeMap::new(),
            created_at,
            settled_at: None,
        }
    }

    /// A pending record paying what is left of an entry after partial
    /// payments. `remaining` already includes fees charged on the partials.
    pub fn follow_up(
        entry: &ScheduleEntry,
        previous: RecordId,
        remaining: Decimal,
        tendered: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::from_entry(entry, created_at);
        record.amount = remaining;
        record.tendered_amount = Some(tendered);
        record.follow_up_of = Some(previous);
        record.status = PaymentStatus::Pending;
        record
    }

    /// A pending principal prepayment outside the schedule.
    pub fn ad_hoc(
        loan_id: LoanId,
        principal: Decimal,
        tendered: Decimal,
        currency: Currency,
        paid_at: DateTime<Utc>,
        source: PaymentSource,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = RecordId::generate();
        Self {
            id,
            reference_number: reference_number(id, created_at),
            loan_id,
            payment_number: None,
            amount: principal,
            principal_amount: principal,
            interest_amount: Decimal::ZERO,
            fee_amount: Decimal::ZERO,
            late_fee_amount: Some(Decimal::ZERO),
            early_payment_fee_amount: Decimal::ZERO,
            additional_amount: Decimal::ZERO,
            amount_received: Decimal::ZERO,
            tendered_amount: Some(tendered),
            currency,
            due_date: paid_at.date_naive(),
            payment_date: Some(paid_at),
            days_late: 0,
            is_overdue: false,
            status: PaymentStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            principal_balance_after: None,
            total_balance_after: None,
            interest_rate_applied: Decimal::ZERO,
            days_in_period: 0,
            is_adjusted: false,
            adjustment_history: Vec::new(),
            source,
            follow_up_of: None,
            metadata: BTreeMap::new(),
            created_at,
            settled_at: None,
        }
    }

    /// Total the payer must hand over for this record to complete.
    pub fn amount_due(&self) -> Decimal {
        self.amount + self.late_fee_amount.unwrap_or_default() + self.early_payment_fee_amount
    }

    /// Overdue is derived from the clock, never trusted from storage.
    pub fn overdue_as_of(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_settled() && now.date_naive() > self.due_date
    }

    pub fn days_late_at(&self, at: DateTime<Utc>) -> u32 {
        let days = (at.date_naive() - self.due_date).num_days();
        u32::try_from(days.max(0)).unwrap_or(u32::MAX)
    }

    pub fn snapshot(&self) -> FinancialSnapshot {
        FinancialSnapshot {
            status: self.status,
            amount: self.amount,
            principal_amount: self.principal_amount,
            interest_amount: self.interest_amount,
            fee_amount: self.fee_amount,
            late_fee_amount: self.late_fee_amount,
            early_payment_fee_amount: self.early_payment_fee_amount,
            additional_amount: self.additional_amount,
            amount_received: self.amount_received,
            due_date: self.due_date,
        }
    }

    /// Principal this record removes from the outstanding balance.
    pub fn committed_principal(&self) -> Decimal {
        if self.status == PaymentStatus::Completed {
            self.principal_amount
        } else {
            Decimal::ZERO
        }
    }
}

/// `RP-YYYYMMDD-XXXXXXXXXXXX`, derived from the record id.
pub fn reference_number(id: RecordId, at: DateTime<Utc>) -> String {
    let simple = id.0.simple().to_string().to_uppercase();
    format!("RP-{}-{}", at.format("%Y%m%d"), &simple[..12])
}
