//! Manual corrections to payment records.
//!
//! An adjustment never rewrites history: the previous values are kept in the
//! appended [`AdjustmentEntry`] and the record's current fields are updated.

use super::payment::{AdjustmentEntry, PaymentRecord};
use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fields an adjustment may change. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentChanges {
    pub principal_amount: Option<Decimal>,
    pub interest_amount: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub late_fee_amount: Option<Decimal>,
    pub early_payment_fee_amount: Option<Decimal>,
    pub additional_amount: Option<Decimal>,
    pub due_date: Option<NaiveDate>,
}

impl AdjustmentChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Net change an adjustment makes to a record's money fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentDelta {
    pub principal: Decimal,
    pub interest: Decimal,
    pub fees: Decimal,
}

impl AdjustmentDelta {
    pub fn between(before: &PaymentRecord, after: &PaymentRecord) -> Self {
        let fees = |r: &PaymentRecord| {
            r.fee_amount + r.late_fee_amount.unwrap_or_default() + r.early_payment_fee_amount
        };
        Self {
            principal: after.committed_principal() - before.committed_principal(),
            interest: after.interest_amount - before.interest_amount,
            fees: fees(after) - fees(before),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.principal.is_zero() && self.interest.is_zero() && self.fees.is_zero()
    }
}

/// Applies `changes` to a copy of `record` and logs the change.
pub fn apply(
    record: &PaymentRecord,
    changes: &AdjustmentChanges,
    reason: &str,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<(PaymentRecord, AdjustmentDelta)> {
    require_text("reason", reason)?;
    require_text("actor", actor)?;
    if changes.is_empty() {
        return Err(EngineError::Validation(
            "adjustment does not change anything".to_string(),
        ));
    }
    for (name, value) in [
        ("principal_amount", changes.principal_amount),
        ("interest_amount", changes.interest_amount),
        ("fee_amount", changes.fee_amount),
        ("late_fee_amount", changes.late_fee_amount),
        ("early_payment_fee_amount", changes.early_payment_fee_amount),
        ("additional_amount", changes.additional_amount),
    ] {
        if value.is_some_and(|v| v < Decimal::ZERO) {
            return Err(EngineError::Validation(format!("{name} must not be negative")));
        }
    }

    let before = record.snapshot();
    let mut next = record.clone();
    if let Some(v) = changes.principal_amount {
        next.principal_amount = v;
    }
    if let Some(v) = changes.interest_amount {
        next.interest_amount = v;
    }
    if let Some(v) = changes.fee_amount {
        next.fee_amount = v;
    }
    if let Some(v) = changes.late_fee_amount {
        next.late_fee_amount = Some(v);
    }
    if let Some(v) = changes.early_payment_fee_amount {
        next.early_payment_fee_amount = v;
    }
    if let Some(v) = changes.additional_amount {
        next.additional_amount = v;
    }
    if let Some(date) = changes.due_date {
        next.due_date = date;
    }
    // `amount` may differ from the component sum (follow-ups carry only what
    // was left), so it moves by the component delta instead of being rebuilt.
    let component_delta = (next.principal_amount - record.principal_amount)
        + (next.interest_amount - record.interest_amount)
        + (next.fee_amount - record.fee_amount);
    if !component_delta.is_zero() {
        next.amount = (record.amount + component_delta).max(Decimal::ZERO);
    }
    next.is_adjusted = true;
    next.adjustment_history.push(AdjustmentEntry {
        timestamp: at,
        actor: actor.to_string(),
        reason: reason.to_string(),
        before,
        after: next.snapshot(),
    });

    let delta = AdjustmentDelta::between(record, &next);
    Ok((next, delta))
}

/// Logs a change of status that carries no financial effect (waivers).
pub fn log_status_change(
    record: &mut PaymentRecord,
    before: &PaymentRecord,
    reason: &str,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    require_text("reason", reason)?;
    require_text("actor", actor)?;
    record.adjustment_history.push(AdjustmentEntry {
        timestamp: at,
        actor: actor.to_string(),
        reason: reason.to_string(),
        before: before.snapshot(),
        after: record.snapshot(),
    });
    Ok(())
}

fn require_text(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{name} is required")))
    } else {
        Ok(())
    }
}
