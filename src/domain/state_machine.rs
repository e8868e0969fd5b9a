//! Legal lifecycle of a [`PaymentRecord`].
//!
//! ```text
//! scheduled -> due -> pending -> processing -> completed
//!      \______________/             |  \----> partial
//!                                   v
//!                      pending <- failed --(retries exhausted)--> cancelled
//! any non-terminal -> cancelled | waived
//! ```
//!
//! [`apply`] is pure: it works on a copy and either returns the next record or
//! an error, leaving the input untouched.

use super::adjustment;
use super::fees;
use super::payment::{PaymentRecord, PaymentStatus};
use super::terms::LoanTerms;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum PaymentEvent {
    /// The due date has been reached.
    MarkDue,
    /// A payer started paying.
    Initiate,
    /// Settlement started; replaying it with the same reference is a no-op.
    BeginSettlement { reference_number: String },
    /// Settlement finished with `received` in hand.
    Settle {
        received: Decimal,
        paid_at: Option<DateTime<Utc>>,
    },
    /// Settlement was rejected by the payment channel.
    Reject { reason: String },
    /// Backoff elapsed for a failed record.
    Retry,
    Cancel { actor: String, reason: String },
    Waive { actor: String, reason: String },
}

impl PaymentEvent {
    /// The state this event moves a record into on its primary path.
    pub fn target(&self) -> PaymentStatus {
        match self {
            PaymentEvent::MarkDue => PaymentStatus::Due,
            PaymentEvent::Initiate | PaymentEvent::Retry => PaymentStatus::Pending,
            PaymentEvent::BeginSettlement { .. } => PaymentStatus::Processing,
            PaymentEvent::Settle { .. } => PaymentStatus::Completed,
            PaymentEvent::Reject { .. } => PaymentStatus::Failed,
            PaymentEvent::Cancel { .. } => PaymentStatus::Cancelled,
            PaymentEvent::Waive { .. } => PaymentStatus::Waived,
        }
    }
}

/// What the engine must do after a transition besides storing the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Balance-affecting settlement; the ledger must be replayed.
    Commit,
    /// Retries are exhausted and the loan needs manual collection.
    ManualCollection,
}

/// Facts about the loan the state machine needs but does not own.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub terms: &'a LoanTerms,
    pub config: &'a EngineConfig,
    /// Principal still owed on the loan before this record settles.
    pub outstanding_principal: Decimal,
    /// Another record for the same schedule entry already carries a late fee.
    pub late_fee_charged_on_entry: bool,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub record: PaymentRecord,
    pub from: PaymentStatus,
    pub effect: Effect,
}

pub fn apply(
    record: &PaymentRecord,
    event: &PaymentEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Transition> {
    let from = record.status;
    let illegal = || EngineError::IllegalTransition {
        from,
        to: event.target(),
    };
    let mut next = record.clone();
    let mut effect = Effect::None;

    match (from, event) {
        (PaymentStatus::Scheduled, PaymentEvent::MarkDue) => {
            if ctx.now.date_naive() < record.due_date {
                return Err(illegal());
            }
            next.status = PaymentStatus::Due;
        }
        (PaymentStatus::Scheduled | PaymentStatus::Due, PaymentEvent::Initiate) => {
            next.status = PaymentStatus::Pending;
        }
        (PaymentStatus::Pending, PaymentEvent::BeginSettlement { reference_number })
            if *reference_number == record.reference_number =>
        {
            next.status = PaymentStatus::Processing;
        }
        (PaymentStatus::Processing, PaymentEvent::BeginSettlement { reference_number })
            if *reference_number == record.reference_number =>
        {
            return Ok(Transition {
                record: next,
                from,
                effect,
            });
        }
        (PaymentStatus::Processing, PaymentEvent::Settle { received, paid_at }) => {
            if *received <= Decimal::ZERO {
                return Err(illegal());
            }
            let paid_at = paid_at.or(record.payment_date).unwrap_or(ctx.now);
            effect = settle(&mut next, *received, paid_at, ctx);
        }
        (PaymentStatus::Processing, PaymentEvent::Reject { reason }) => {
            effect = fail(&mut next, reason, ctx)?;
        }
        (PaymentStatus::Failed, PaymentEvent::Retry) => {
            if record.next_retry_at.is_some_and(|at| ctx.now < at) {
                return Err(illegal());
            }
            next.status = PaymentStatus::Pending;
            next.next_retry_at = None;
        }
        (status, PaymentEvent::Cancel { actor, reason }) if status.is_open() => {
            next.status = PaymentStatus::Cancelled;
            next.next_retry_at = None;
            next.metadata
                .insert("cancelled_by".to_string(), actor.clone());
            next.metadata
                .insert("cancellation_reason".to_string(), reason.clone());
        }
        (status, PaymentEvent::Waive { actor, reason }) if status.is_open() => {
            next.status = PaymentStatus::Waived;
            next.next_retry_at = None;
            next.settled_at = Some(ctx.now);
            adjustment::log_status_change(&mut next, record, reason, actor, ctx.now)?;
        }
        _ => return Err(illegal()),
    }

    next.is_overdue = next.overdue_as_of(ctx.now);
    Ok(Transition {
        record: next,
        from,
        effect,
    })
}

fn settle(
    record: &mut PaymentRecord,
    received: Decimal,
    paid_at: DateTime<Utc>,
    ctx: &TransitionContext<'_>,
) -> Effect {
    let scale = ctx.config.amount_scale;
    // Never take more principal than the loan still owes.
    if record.principal_amount > ctx.outstanding_principal {
        let excess = record.principal_amount - ctx.outstanding_principal;
        record.principal_amount = ctx.outstanding_principal;
        record.amount = (record.amount - excess).max(Decimal::ZERO);
    }
    let late_fee = fees::late_fee(
        record,
        ctx.terms,
        paid_at,
        ctx.late_fee_charged_on_entry,
        scale,
    );
    record.late_fee_amount = Some(late_fee);
    if record.payment_number.is_some() && record.follow_up_of.is_none() {
        record.early_payment_fee_amount = fees::early_payment_fee(
            record,
            ctx.terms,
            paid_at,
            ctx.outstanding_principal,
            scale,
        );
    }
    record.days_late = record.days_late_at(paid_at);
    record.payment_date = Some(paid_at);
    record.settled_at = Some(ctx.now);
    record.amount_received = received;
    record.next_retry_at = None;
    record.failure_reason = None;

    let amount_due = record.amount_due();
    if received >= amount_due {
        let headroom = (ctx.outstanding_principal - record.principal_amount).max(Decimal::ZERO);
        let prepaid = (received - amount_due).min(headroom);
        record.principal_amount += prepaid;
        record.additional_amount = prepaid;
        record.status = PaymentStatus::Completed;
    } else {
        // Nothing reaches the ledger until the entry is paid in full.
        record.principal_amount = Decimal::ZERO;
        record.interest_amount = Decimal::ZERO;
        record.fee_amount = Decimal::ZERO;
        record.status = PaymentStatus::Partial;
    }
    Effect::Commit
}

fn fail(
    record: &mut PaymentRecord,
    reason: &str,
    ctx: &TransitionContext<'_>,
) -> Result<Effect> {
    let policy = &ctx.config.retry;
    record.failure_reason = Some(reason.to_string());
    let attempts = record.retry_count.saturating_add(1);
    if attempts > policy.max_retry_count {
        record.status = PaymentStatus::Cancelled;
        record.next_retry_at = None;
        return Ok(Effect::ManualCollection);
    }
    let retry_at = ctx
        .now
        .checked_add_signed(policy.backoff(record.retry_count))
        .ok_or_else(|| {
            EngineError::Validation(format!("retry time after {} is out of range", ctx.now))
        })?;
    record.next_retry_at = Some(retry_at);
    record.retry_count = attempts;
    record.status = PaymentStatus::Failed;
    Ok(Effect::None)
}
