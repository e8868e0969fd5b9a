//! Late, early-payment and origination fee rules.

use super::money::{percent, round_money};
use super::payment::PaymentRecord;
use super::terms::LoanTerms;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Late fee owed by `record` if it settles at `paid_at`.
///
/// A fee already evaluated on the record is returned unchanged so retries of
/// the same payment never charge twice. `charged_on_entry` is set when another
/// record for the same schedule entry already carries the fee.
pub fn late_fee(
    record: &PaymentRecord,
    terms: &LoanTerms,
    paid_at: DateTime<Utc>,
    charged_on_entry: bool,
    scale: u32,
) -> Decimal {
    if let Some(fee) = record.late_fee_amount {
        return fee;
    }
    if charged_on_entry || record.payment_number.is_none() {
        return Decimal::ZERO;
    }
    let days_late = record.days_late_at(paid_at);
    if !record.overdue_as_of(paid_at) || days_late <= terms.grace_period_days {
        return Decimal::ZERO;
    }
    round_money(
        terms.late_fee.fixed + percent(terms.late_fee.percentage) * record.amount,
        scale,
    )
}

/// Fee for settling before the due date, charged on the principal still
/// outstanding for that period.
pub fn early_payment_fee(
    record: &PaymentRecord,
    terms: &LoanTerms,
    paid_at: DateTime<Utc>,
    remaining_principal: Decimal,
    scale: u32,
) -> Decimal {
    let early = paid_at.date_naive() < record.due_date;
    let chargeable =
        !terms.allow_early_repayment || terms.early_payment_fee_percentage > Decimal::ZERO;
    if !early || !chargeable || remaining_principal <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_money(
        percent(terms.early_payment_fee_percentage) * remaining_principal,
        scale,
    )
}
