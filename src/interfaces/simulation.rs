//! Replays a list of payment commands against a single loan.

use super::csv::command_reader::{CommandType, PaymentCommand};
use crate::application::engine::RepaymentEngine;
use crate::domain::LoanId;
use crate::domain::ledger::ReconciliationWarning;
use crate::domain::money::Currency;
use crate::domain::payment::{PaymentRecord, PaymentSource, PaymentStatus};
use crate::domain::state_machine::PaymentEvent;
use crate::error::{EngineError, Result};
use crate::infrastructure::clock::ManualClock;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

const ACTOR: &str = "simulation";

/// Drives one loan through a sequence of [`PaymentCommand`]s. The engine must
/// have been built with `clock` so each command runs at its own instant.
pub struct Simulation<'a> {
    engine: &'a RepaymentEngine,
    clock: ManualClock,
    loan_id: LoanId,
    currency: Currency,
}

impl<'a> Simulation<'a> {
    pub fn new(
        engine: &'a RepaymentEngine,
        clock: ManualClock,
        loan_id: LoanId,
        currency: Currency,
    ) -> Self {
        Self {
            engine,
            clock,
            loan_id,
            currency,
        }
    }

    pub fn loan_id(&self) -> LoanId {
        self.loan_id
    }

    /// Applies one command. `row` only tags the payment source.
    pub async fn apply(
        &self,
        row: usize,
        command: &PaymentCommand,
    ) -> Result<Vec<ReconciliationWarning>> {
        let at = command.at;
        self.clock.set(at);
        match command.r#type {
            CommandType::Pay => {
                let amount = required_amount(command)?;
                self.engine
                    .record_payment(
                        self.loan_id,
                        command.payment_number,
                        amount,
                        &self.currency,
                        at,
                        PaymentSource::Transaction(format!("row-{row}")),
                    )
                    .await?;
                Ok(Vec::new())
            }
            CommandType::Settle => {
                let received = required_amount(command)?;
                let record = self.begin_settlement(command.payment_number).await?;
                let settled = self
                    .engine
                    .transition(
                        record.id,
                        PaymentEvent::Settle {
                            received,
                            paid_at: Some(at),
                        },
                    )
                    .await?;
                Ok(settled.warnings)
            }
            CommandType::Fail => {
                let record = self.begin_settlement(command.payment_number).await?;
                let reason = command
                    .reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string());
                let failed = self
                    .engine
                    .transition(record.id, PaymentEvent::Reject { reason })
                    .await?;
                Ok(failed.warnings)
            }
            CommandType::Waive => {
                let reason = required_reason(command)?;
                let record = self
                    .find(command.payment_number, |s| s.is_open())
                    .await?;
                let waived = self
                    .engine
                    .transition(
                        record.id,
                        PaymentEvent::Waive {
                            actor: ACTOR.to_string(),
                            reason,
                        },
                    )
                    .await?;
                Ok(waived.warnings)
            }
            CommandType::Tick => {
                self.engine.run_due_retries(at).await?;
                Ok(Vec::new())
            }
            CommandType::Cancel => {
                let reason = required_reason(command)?;
                self.engine.cancel_loan(self.loan_id, ACTOR, &reason).await?;
                Ok(Vec::new())
            }
        }
    }

    pub async fn records(&self) -> Result<Vec<PaymentRecord>> {
        self.engine.records(self.loan_id).await
    }

    /// Moves the in-flight record for `payment_number` into `processing`.
    async fn begin_settlement(&self, payment_number: Option<u32>) -> Result<PaymentRecord> {
        let record = self
            .find(payment_number, |s| {
                matches!(s, PaymentStatus::Pending | PaymentStatus::Processing)
            })
            .await?;
        if record.status == PaymentStatus::Processing {
            return Ok(record);
        }
        let started = self
            .engine
            .transition(
                record.id,
                PaymentEvent::BeginSettlement {
                    reference_number: record.reference_number.clone(),
                },
            )
            .await?;
        Ok(started.value)
    }

    /// Newest record of the entry (or of the ad hoc payments) in a matching
    /// state.
    async fn find(
        &self,
        payment_number: Option<u32>,
        status: impl Fn(PaymentStatus) -> bool,
    ) -> Result<PaymentRecord> {
        self.records()
            .await?
            .into_iter()
            .filter(|r| r.payment_number == payment_number && status(r.status))
            .max_by_key(|r| r.created_at)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "no matching payment for entry {}",
                    describe(payment_number)
                ))
            })
    }
}

fn required_amount(command: &PaymentCommand) -> Result<Decimal> {
    command.amount.ok_or_else(|| {
        EngineError::Validation(format!("{:?} at {} needs an amount", command.r#type, stamp(command.at)))
    })
}

fn required_reason(command: &PaymentCommand) -> Result<String> {
    command
        .reason
        .clone()
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Validation(format!("{:?} at {} needs a reason", command.r#type, stamp(command.at)))
        })
}

fn describe(payment_number: Option<u32>) -> String {
    payment_number.map_or_else(|| "ad hoc".to_string(), |n| format!("#{n}"))
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}
