//! Ledger reconciliation.
//!
//! Balances are never patched incrementally. Every commit replays the loan's
//! settled records from the original principal, so an adjustment anywhere in
//! the history re-derives every later `*_balance_after` in one pass.

use super::loan::{EntryState, LoanBook, LoanStatus};
use super::money::Balance;
use super::payment::{PaymentRecord, PaymentStatus};
use super::{LoanId, RecordId};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::warn;

/// A settled balance that drifted from the schedule's projection. Surfaced to
/// the caller; the commit itself still succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationWarning {
    pub loan_id: LoanId,
    pub record_id: RecordId,
    pub payment_number: u32,
    pub expected_balance_after: Decimal,
    pub actual_balance_after: Decimal,
    pub divergence: Decimal,
}

/// Replays the ledger for `book` and returns divergences for the records
/// whose balances moved in this commit, plus `focus` if given.
pub fn reconcile(
    book: &mut LoanBook,
    focus: Option<RecordId>,
    config: &EngineConfig,
) -> Result<Vec<ReconciliationWarning>> {
    let previous: HashMap<RecordId, Option<Decimal>> = book
        .records
        .iter()
        .map(|r| (r.id, r.principal_balance_after))
        .collect();

    let mut order: Vec<usize> = (0..book.records.len())
        .filter(|&i| book.records[i].status.is_settled())
        .collect();
    order.sort_by(|&a, &b| ledger_order(&book.records[a], &book.records[b]));

    let mut running = book.loan.terms.principal;
    for index in order {
        let committed = book.records[index].committed_principal();
        running -= committed;
        if running < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "record {} takes the principal of loan {} below zero",
                book.records[index].id, book.loan.id
            )));
        }
        let remaining_charges = charges_after(book, book.records[index].payment_number);
        let record = &mut book.records[index];
        record.principal_balance_after = Some(running);
        record.total_balance_after = Some(running + remaining_charges);
    }
    // Balances only belong to records that actually settled.
    for record in book.records.iter_mut().filter(|r| !r.status.is_settled()) {
        record.principal_balance_after = None;
        record.total_balance_after = None;
    }

    book.loan.outstanding_principal = Balance::new(running);
    book.loan.total_outstanding = Balance::new(running + open_charges(book));
    if book.loan.status == LoanStatus::Active && running.is_zero() && !book.has_open_entries() {
        book.loan.status = LoanStatus::Repaid;
    }

    let mut warnings = Vec::new();
    for record in &book.records {
        let moved = previous.get(&record.id).copied().flatten() != record.principal_balance_after;
        if !(moved || focus == Some(record.id)) || record.status != PaymentStatus::Completed {
            continue;
        }
        let (Some(number), Some(actual)) = (record.payment_number, record.principal_balance_after)
        else {
            continue;
        };
        let Some(entry) = book.entry(number) else {
            continue;
        };
        let divergence = actual - entry.expected_balance_after;
        if divergence.abs() > config.reconciliation_epsilon {
            warn!(
                loan_id = %book.loan.id,
                record_id = %record.id,
                payment_number = number,
                expected = %entry.expected_balance_after,
                actual = %actual,
                "Balance diverges from schedule"
            );
            warnings.push(ReconciliationWarning {
                loan_id: book.loan.id,
                record_id: record.id,
                payment_number: number,
                expected_balance_after: entry.expected_balance_after,
                actual_balance_after: actual,
                divergence,
            });
        }
    }

    check_invariants(book)?;
    Ok(warnings)
}

/// Scheduled entries first by number, ad hoc payments after them; ties by
/// settlement time and id so the replay is deterministic.
fn ledger_order(a: &PaymentRecord, b: &PaymentRecord) -> Ordering {
    let number = |r: &PaymentRecord| r.payment_number.unwrap_or(u32::MAX);
    number(a)
        .cmp(&number(b))
        .then(a.settled_at.cmp(&b.settled_at))
        .then(a.id.cmp(&b.id))
}

/// Scheduled interest and fees of entries after `payment_number` that still
/// count towards the projection.
fn charges_after(book: &LoanBook, payment_number: Option<u32>) -> Decimal {
    book.schedule
        .iter()
        .filter(|e| payment_number.is_none_or(|n| e.payment_number > n))
        .filter(|e| matches!(book.entry_state(e.payment_number), EntryState::Open { .. }))
        .map(|e| e.expected_interest + e.expected_fee)
        .sum()
}

/// Unpaid interest, fees and late charges on every open entry, net of money
/// already taken by partial records.
fn open_charges(book: &LoanBook) -> Decimal {
    let mut total = Decimal::ZERO;
    for entry in &book.schedule {
        if let EntryState::Open { received } = book.entry_state(entry.payment_number) {
            let late: Decimal = book
                .records_for_entry(entry.payment_number)
                .filter(|r| r.status == PaymentStatus::Partial)
                .map(|r| r.late_fee_amount.unwrap_or_default() + r.early_payment_fee_amount)
                .sum();
            total += entry.expected_interest + entry.expected_fee + late - received;
        }
    }
    total
}

/// Checks the loan-wide invariants that must hold after every mutation.
pub fn check_invariants(book: &LoanBook) -> Result<()> {
    let loan = &book.loan;

    for (index, entry) in book.schedule.iter().enumerate() {
        if entry.payment_number != index as u32 + 1 {
            return Err(violation(format!(
                "schedule of loan {} is not a dense 1..N sequence at position {}",
                loan.id,
                index + 1
            )));
        }
        if entry.currency != loan.terms.currency {
            return Err(violation(format!(
                "entry #{} is in {} but loan {} is in {}",
                entry.payment_number, entry.currency, loan.id, loan.terms.currency
            )));
        }
    }

    if let Some(record) = book
        .records
        .iter()
        .find(|r| r.currency != loan.terms.currency)
    {
        return Err(violation(format!(
            "record {} is in {} but loan {} is in {}",
            record.id, record.currency, loan.id, loan.terms.currency
        )));
    }

    if let Some((record, number)) = book.records.iter().find_map(|r| {
        r.payment_number
            .filter(|n| *n == 0 || *n as usize > book.schedule.len())
            .map(|n| (r, n))
    }) {
        return Err(violation(format!(
            "record {} points at entry #{number}, which loan {} does not have",
            record.id, loan.id
        )));
    }

    let mut completed: Vec<&PaymentRecord> = book
        .records
        .iter()
        .filter(|r| r.status == PaymentStatus::Completed && r.payment_number.is_some())
        .collect();
    completed.sort_by(|a, b| ledger_order(a, b));
    let mut last = loan.terms.principal;
    for record in completed {
        let balance = record.principal_balance_after.unwrap_or(last);
        if balance < Decimal::ZERO || balance > last {
            return Err(violation(format!(
                "principal balance after record {} is {balance}, previous was {last}",
                record.id
            )));
        }
        last = balance;
    }

    let paid: Decimal = book
        .records
        .iter()
        .filter(|r| matches!(r.status, PaymentStatus::Completed | PaymentStatus::Partial))
        .map(|r| r.committed_principal())
        .sum();
    if paid > loan.terms.principal {
        return Err(violation(format!(
            "loan {} has {paid} principal paid against {}",
            loan.id, loan.terms.principal
        )));
    }
    if loan.terms.principal - paid != loan.outstanding_principal.value() {
        return Err(violation(format!(
            "loan {} outstanding {} does not match principal minus payments {}",
            loan.id,
            loan.outstanding_principal.value(),
            loan.terms.principal - paid
        )));
    }
    Ok(())
}

/// Verifies a mutation did not rewrite settled history.
///
/// Settled records keep their money fields unless `adjusted` names them, and
/// adjustment logs only ever grow. Schedule entries tied to settled records
/// stay exactly as they were.
pub fn ensure_history_preserved(
    before: &LoanBook,
    after: &LoanBook,
    adjusted: Option<RecordId>,
) -> Result<()> {
    for old in before.records.iter().filter(|r| r.status.is_settled()) {
        let Some(new) = after.record(old.id) else {
            return Err(violation(format!("settled record {} was removed", old.id)));
        };
        if !new.adjustment_history.starts_with(&old.adjustment_history) {
            return Err(violation(format!(
                "adjustment history of record {} was rewritten",
                old.id
            )));
        }
        if Some(old.id) == adjusted {
            if new.adjustment_history.len() <= old.adjustment_history.len() {
                return Err(violation(format!(
                    "record {} changed without an adjustment entry",
                    old.id
                )));
            }
        } else if new.snapshot() != old.snapshot() {
            return Err(violation(format!(
                "settled record {} changed outside an adjustment",
                old.id
            )));
        }
    }

    for number in before.settled_payment_numbers() {
        if before.entry(number) != after.entry(number) {
            return Err(violation(format!(
                "schedule entry #{number} of loan {} is settled and cannot change",
                before.loan.id
            )));
        }
    }
    Ok(())
}

fn violation(message: String) -> EngineError {
    EngineError::InvariantViolation(message)
}
