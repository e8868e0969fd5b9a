//! Amortization schedule generation.
//!
//! Generation is a pure function of the terms, the activation date and the
//! engine configuration: the same inputs always yield the same entries.

use super::LoanId;
use super::money::{Currency, MAX_AMOUNT, ceil_money, round_money};
use super::terms::{InterestType, LoanTerms};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use chrono::{Days, NaiveDate};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on periods a single schedule may contain.
const MAX_PERIODS: u32 = 36_600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub loan_id: LoanId,
    /// 1-based, dense and unique per loan.
    pub payment_number: u32,
    pub due_date: NaiveDate,
    pub days_in_period: u32,
    /// Effective interest rate for the whole period, as a fraction.
    pub period_rate: Decimal,
    pub expected_principal: Decimal,
    pub expected_interest: Decimal,
    pub expected_fee: Decimal,
    /// Principal still owed once this entry is paid as projected.
    pub expected_balance_after: Decimal,
    pub currency: Currency,
    /// `false` for entries inserted by hand rather than by the generator.
    pub is_generated: bool,
}

impl ScheduleEntry {
    pub fn total_due(&self) -> Decimal {
        self.expected_principal + self.expected_interest + self.expected_fee
    }
}

/// Builds the full schedule for `terms` starting at `activation`.
pub fn generate(
    loan_id: LoanId,
    terms: &LoanTerms,
    activation: NaiveDate,
    config: &EngineConfig,
) -> Result<Vec<ScheduleEntry>> {
    build(loan_id, terms, activation, config, &BTreeMap::new())
}

/// Rebuilds a schedule after a term change.
///
/// Entries whose payment number is in `frozen` are kept exactly as they are.
/// The principal still owed between two kept entries is amortized over the
/// fresh entries that sit between them, so the schedule keeps summing to the
/// loan principal. A kept entry that no longer exists, or whose period no
/// longer lines up with the new terms, is a [`EngineError::ScheduleConflict`].
pub fn regenerate(
    existing: &[ScheduleEntry],
    frozen: &BTreeSet<u32>,
    loan_id: LoanId,
    terms: &LoanTerms,
    activation: NaiveDate,
    config: &EngineConfig,
) -> Result<Vec<ScheduleEntry>> {
    let kept: BTreeMap<u32, &ScheduleEntry> = existing
        .iter()
        .filter(|entry| frozen.contains(&entry.payment_number))
        .map(|entry| (entry.payment_number, entry))
        .collect();
    build(loan_id, terms, activation, config, &kept)
}

/// One slot of the period layout.
struct Period {
    days: u32,
    due_date: NaiveDate,
}

fn build(
    loan_id: LoanId,
    terms: &LoanTerms,
    activation: NaiveDate,
    config: &EngineConfig,
    kept: &BTreeMap<u32, &ScheduleEntry>,
) -> Result<Vec<ScheduleEntry>> {
    terms.validate()?;
    let scale = config.amount_scale;
    let layout = resolve_layout(terms, activation)?;
    let count = layout.len() as u32;

    let conflicts: Vec<u32> = kept
        .values()
        .filter(|entry| {
            (entry.payment_number as usize)
                .checked_sub(1)
                .and_then(|index| layout.get(index))
                .is_none_or(|p| p.due_date != entry.due_date || p.days != entry.days_in_period)
        })
        .map(|entry| entry.payment_number)
        .collect();
    if !conflicts.is_empty() {
        return Err(EngineError::ScheduleConflict {
            loan_id,
            payment_numbers: conflicts,
        });
    }

    let sub_rate = terms.sub_interval_rate()?;
    let calc_days = terms.interest_calculation.days();
    let mut entries = Vec::with_capacity(layout.len());
    let mut outstanding = terms.principal;

    for (index, period) in layout.into_iter().enumerate() {
        let payment_number = index as u32 + 1;
        if let Some(entry) = kept.get(&payment_number) {
            outstanding = entry.expected_balance_after;
            entries.push((*entry).clone());
            continue;
        }

        // This entry belongs to a run of fresh entries that must bring the
        // balance down to where the next kept entry starts, or to zero.
        let (run_len, target) = match kept.range(payment_number..).next() {
            Some((next, entry)) => (
                next - payment_number,
                entry.expected_balance_after + entry.expected_principal,
            ),
            None => (count - index as u32, Decimal::ZERO),
        };
        let to_amortize = outstanding - target;
        let run_start = payment_number == 1 || kept.contains_key(&(payment_number - 1));
        if to_amortize < Decimal::ZERO
            || (run_start
                && !terms.is_end_of_term()
                && to_amortize < config.minor_unit() * Decimal::from(run_len))
        {
            return Err(EngineError::InvalidTerms(format!(
                "principal {to_amortize} cannot be amortized over {run_len} periods"
            )));
        }

        let period_rate = period_rate(terms.interest_type, sub_rate, period.days, calc_days)?;
        let interest = outstanding
            .checked_mul(period_rate)
            .map(|interest| round_money(interest, scale))
            .ok_or_else(|| overflow("interest", payment_number))?;

        let principal = if run_len == 1 {
            to_amortize
        } else if terms.is_end_of_term() {
            Decimal::ZERO
        } else {
            ceil_money(to_amortize / Decimal::from(run_len), scale).min(to_amortize)
        };
        outstanding -= principal;

        let fee = if payment_number == 1 {
            terms.origination_fee_amount(scale)?
        } else {
            Decimal::ZERO
        };
        principal
            .checked_add(interest)
            .and_then(|total| total.checked_add(fee))
            .filter(|total| *total <= MAX_AMOUNT)
            .ok_or_else(|| overflow("installment", payment_number))?;

        entries.push(ScheduleEntry {
            loan_id,
            payment_number,
            due_date: period.due_date,
            days_in_period: period.days,
            period_rate,
            expected_principal: principal,
            expected_interest: interest,
            expected_fee: fee,
            expected_balance_after: outstanding,
            currency: terms.currency.clone(),
            is_generated: true,
        });
    }

    Ok(entries)
}

/// Splits the chosen duration into periods; the final period absorbs the
/// remainder so the total spans exactly the chosen duration.
fn resolve_layout(terms: &LoanTerms, activation: NaiveDate) -> Result<Vec<Period>> {
    let period_len = terms.period_length_days();
    let duration = terms.chosen_duration_days;
    let count = duration / period_len;
    if count == 0 {
        return Err(EngineError::InvalidTerms(format!(
            "duration of {duration} days is shorter than one {period_len}-day period"
        )));
    }
    if count > MAX_PERIODS {
        return Err(EngineError::InvalidTerms(format!(
            "{count} periods exceed the supported maximum of {MAX_PERIODS}"
        )));
    }

    let mut layout = Vec::with_capacity(count as usize);
    let mut elapsed = 0u32;
    for payment_number in 1..=count {
        let days = if payment_number == count {
            duration - period_len * (count - 1)
        } else {
            period_len
        };
        elapsed += days;
        let due_date = activation
            .checked_add_days(Days::new(u64::from(elapsed)))
            .ok_or_else(|| {
                EngineError::InvalidTerms(format!("due date overflows for period {payment_number}"))
            })?;
        layout.push(Period { days, due_date });
    }
    Ok(layout)
}

/// Effective rate over `days`, given the per-sub-interval rate.
fn period_rate(
    interest_type: InterestType,
    sub_rate: Decimal,
    days: u32,
    calc_days: u32,
) -> Result<Decimal> {
    let overflows = || EngineError::InvalidTerms("period interest rate overflows".to_string());
    match interest_type {
        InterestType::Simple => sub_rate
            .checked_mul(Decimal::from(days))
            .map(|rate| rate / Decimal::from(calc_days))
            .ok_or_else(overflows),
        InterestType::Compound => {
            let whole = days / calc_days;
            let fraction = Decimal::from(days % calc_days) / Decimal::from(calc_days);
            let growth = Decimal::ONE
                .checked_add(sub_rate)
                .and_then(|base| base.checked_powu(u64::from(whole)))
                .ok_or_else(overflows)?;
            sub_rate
                .checked_mul(fraction)
                .and_then(|partial| partial.checked_add(Decimal::ONE))
                .and_then(|partial| growth.checked_mul(partial))
                .map(|rate| rate - Decimal::ONE)
                .ok_or_else(overflows)
        }
    }
}

fn overflow(what: &str, payment_number: u32) -> EngineError {
    EngineError::InvalidTerms(format!("{what} of period {payment_number} overflows"))
}
