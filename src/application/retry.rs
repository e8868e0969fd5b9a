//! Time-driven work: due dates coming up and failed payments whose backoff
//! elapsed.

use super::engine::RepaymentEngine;
use crate::domain::loan::LoanBook;
use crate::domain::payment::PaymentStatus;
use crate::domain::ports::Clock;
use crate::domain::RecordId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// Records of one loan that a scheduler pass should advance.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DueWork {
    /// `scheduled` records whose due date has been reached.
    pub mark_due: Vec<RecordId>,
    /// `failed` records whose `next_retry_at` has passed.
    pub retry: Vec<RecordId>,
    /// Retried records left `pending` because their claim never happened.
    pub reclaim: Vec<RecordId>,
}

impl DueWork {
    pub fn is_empty(&self) -> bool {
        !self.has_transitions() && self.reclaim.is_empty()
    }

    /// Whether any record needs a status change before claiming.
    pub fn has_transitions(&self) -> bool {
        !self.mark_due.is_empty() || !self.retry.is_empty()
    }

    /// Records to claim for processing once the transitions are committed.
    pub fn claimable(&self) -> Vec<RecordId> {
        self.retry.iter().chain(&self.reclaim).copied().collect()
    }
}

pub fn due_work(book: &LoanBook, now: DateTime<Utc>) -> DueWork {
    let today = now.date_naive();
    let mut work = DueWork::default();
    for record in &book.records {
        match record.status {
            PaymentStatus::Scheduled if record.due_date <= today => work.mark_due.push(record.id),
            PaymentStatus::Failed if record.next_retry_at.is_none_or(|at| at <= now) => {
                work.retry.push(record.id)
            }
            // Only a retry puts a record with failed attempts back in `pending`.
            PaymentStatus::Pending if record.retry_count > 0 => work.reclaim.push(record.id),
            _ => {}
        }
    }
    work
}

/// Calls [`RepaymentEngine::run_due_retries`] on a fixed interval until told
/// to stop.
pub struct RetryScheduler {
    engine: Arc<RepaymentEngine>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RetryScheduler {
    /// Returns the scheduler and the sender that stops it (send `true`).
    pub fn new(
        engine: Arc<RepaymentEngine>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> (Self, watch::Sender<bool>) {
        let (tx, shutdown) = watch::channel(false);
        (
            Self {
                engine,
                clock,
                period,
                shutdown,
            },
            tx,
        )
    }

    pub async fn run(mut self) {
        info!(period_ms = self.period.as_millis() as u64, "Retry scheduler started");
        let mut ticker = interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.engine.run_due_retries(self.clock.now()).await {
                        Ok(claimed) if !claimed.is_empty() => {
                            info!(claimed = claimed.len(), "Retries claimed");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Retry pass failed"),
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Retry scheduler stopped");
    }
}
