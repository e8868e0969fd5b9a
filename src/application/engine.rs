use super::locks::LoanLocks;
use super::retry;
use crate::config::EngineConfig;
use crate::domain::adjustment::{self, AdjustmentChanges, AdjustmentDelta};
use crate::domain::events::EngineEvent;
use crate::domain::ledger::{self, ReconciliationWarning};
use crate::domain::loan::{EntryState, Loan, LoanBook, LoanStatus};
use crate::domain::money::{Amount, Currency};
use crate::domain::payment::{PaymentRecord, PaymentSource, PaymentStatus};
use crate::domain::ports::{Clock, CurrencyRegistry, EventSink, LedgerStoreBox};
use crate::domain::schedule::{self, ScheduleEntry};
use crate::domain::state_machine::{self, Effect, PaymentEvent, TransitionContext};
use crate::domain::terms::LoanTerms;
use crate::domain::{LoanId, RecordId};
use crate::error::{EngineError, Result};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::currency::StaticCurrencyRegistry;
use crate::infrastructure::events::NullEventSink;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Attempts a mutation gets while its commits keep losing version races.
const MAX_COMMIT_ATTEMPTS: u32 = 8;

/// Result of a mutation that went through the ledger. Warnings never fail the
/// call; they tell the caller which balances drifted from the schedule.
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub value: T,
    pub warnings: Vec<ReconciliationWarning>,
}

/// An adjusted record together with what the adjustment changed.
#[derive(Debug, Clone)]
pub struct Adjusted {
    pub record: PaymentRecord,
    pub delta: AdjustmentDelta,
}

/// Working state of one mutation. Only committed if the closure, the ledger
/// replay and the history check all succeed.
struct Mutation {
    book: LoanBook,
    now: DateTime<Utc>,
    focus: Option<RecordId>,
    adjusted: Option<RecordId>,
    events: Vec<EngineEvent>,
}

impl Mutation {
    fn status_changed(&mut self, record: &PaymentRecord, from: PaymentStatus) {
        if record.status == from {
            return;
        }
        info!(
            loan_id = %record.loan_id,
            record_id = %record.id,
            payment_number = ?record.payment_number,
            from = %from,
            to = %record.status,
            "Payment status changed"
        );
        self.events.push(EngineEvent::StatusChanged {
            loan_id: record.loan_id,
            record_id: record.id,
            payment_number: record.payment_number,
            from,
            to: record.status,
            at: self.now,
        });
    }
}

/// The entry point for every loan repayment operation.
///
/// `RepaymentEngine` owns the storage backend and serializes mutations per
/// loan: each one takes the loan's lock, works on a copy of its book, replays
/// the ledger and commits the whole book at once. Reads go straight to the
/// store without locking.
pub struct RepaymentEngine {
    store: LedgerStoreBox,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    currencies: Arc<dyn CurrencyRegistry>,
    locks: LoanLocks,
}

impl RepaymentEngine {
    /// Creates an engine over `store` using the system clock, the currencies
    /// listed in `config` and no event sink.
    pub fn new(store: LedgerStoreBox, config: EngineConfig) -> Self {
        let currencies = Arc::new(StaticCurrencyRegistry::from_config(&config));
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(NullEventSink),
            currencies,
            locks: LoanLocks::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_currency_registry(mut self, currencies: Arc<dyn CurrencyRegistry>) -> Self {
        self.currencies = currencies;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Computes the schedule `terms` would produce without persisting anything.
    pub fn generate_schedule(
        &self,
        loan_id: LoanId,
        terms: &LoanTerms,
        activation: NaiveDate,
    ) -> Result<Vec<ScheduleEntry>> {
        self.ensure_supported(&terms.currency)?;
        schedule::generate(loan_id, terms, activation, &self.config)
    }

    /// Persists a new loan with its schedule and one `scheduled` record per
    /// entry.
    pub async fn activate_loan(&self, terms: LoanTerms, activation: NaiveDate) -> Result<LoanBook> {
        self.ensure_supported(&terms.currency)?;
        let loan_id = LoanId::generate();
        let now = self.clock.now();
        let schedule = schedule::generate(loan_id, &terms, activation, &self.config)?;
        let records = schedule
            .iter()
            .map(|entry| PaymentRecord::from_entry(entry, now))
            .collect();
        let mut book = LoanBook {
            loan: Loan::new(loan_id, terms, activation, now),
            schedule,
            records,
            version: 0,
        };
        ledger::reconcile(&mut book, None, &self.config)?;

        let _guard = self.locks.acquire(loan_id).await;
        self.store.commit(book.clone()).await?;
        info!(
            loan_id = %loan_id,
            entries = book.schedule.len(),
            principal = %book.loan.terms.principal,
            currency = %book.loan.terms.currency,
            "Loan activated"
        );
        self.events.publish(EngineEvent::LoanActivated {
            loan_id,
            entries: book.schedule.len(),
            at: now,
        });
        Ok(book)
    }

    /// Rebuilds the schedule under `terms`. Settled entries, and entries with a
    /// payment in flight, are kept verbatim; every other entry is recomputed
    /// and its unsettled records replaced.
    pub async fn regenerate_schedule(
        &self,
        loan_id: LoanId,
        terms: LoanTerms,
    ) -> Result<Reconciled<Vec<ScheduleEntry>>> {
        self.ensure_supported(&terms.currency)?;
        let (book, (), warnings) = self
            .mutate(loan_id, |m| {
                ensure_active(&m.book.loan)?;
                if terms.currency != m.book.loan.terms.currency {
                    return Err(EngineError::CurrencyMismatch {
                        expected: m.book.loan.terms.currency.clone(),
                        actual: terms.currency.clone(),
                    });
                }

                let mut frozen = m.book.settled_payment_numbers();
                frozen.extend(
                    m.book
                        .records
                        .iter()
                        .filter(|r| {
                            matches!(r.status, PaymentStatus::Pending | PaymentStatus::Processing)
                        })
                        .filter_map(|r| r.payment_number),
                );
                let fresh = schedule::regenerate(
                    &m.book.schedule,
                    &frozen,
                    loan_id,
                    &terms,
                    m.book.loan.activation_date,
                    &self.config,
                )?;

                // Cancelled records are never replaced, so their entries must survive.
                let orphaned: BTreeSet<u32> = m
                    .book
                    .records
                    .iter()
                    .filter(|r| r.status == PaymentStatus::Cancelled)
                    .filter_map(|r| r.payment_number)
                    .filter(|n| *n as usize > fresh.len())
                    .collect();
                if !orphaned.is_empty() {
                    return Err(EngineError::ScheduleConflict {
                        loan_id,
                        payment_numbers: orphaned.into_iter().collect(),
                    });
                }

                let changed: BTreeSet<u32> = m
                    .book
                    .schedule
                    .iter()
                    .map(|e| e.payment_number)
                    .chain(fresh.iter().map(|e| e.payment_number))
                    .filter(|n| !frozen.contains(n))
                    .filter(|n| {
                        m.book.entry(*n) != fresh.iter().find(|e| e.payment_number == *n)
                    })
                    .collect();

                m.book.records.retain(|r| {
                    let replaced = r.payment_number.is_some_and(|n| changed.contains(&n));
                    !(replaced
                        && matches!(
                            r.status,
                            PaymentStatus::Scheduled | PaymentStatus::Due | PaymentStatus::Failed
                        ))
                });
                m.book.schedule = fresh;
                m.book.loan.terms = terms.clone();

                let now = m.now;
                let new_records: Vec<PaymentRecord> = m
                    .book
                    .schedule
                    .iter()
                    .filter(|e| changed.contains(&e.payment_number))
                    .filter(|e| m.book.records_for_entry(e.payment_number).next().is_none())
                    .map(|e| PaymentRecord::from_entry(e, now))
                    .collect();
                m.book.records.extend(new_records);

                info!(
                    loan_id = %loan_id,
                    entries = m.book.schedule.len(),
                    replaced = changed.len(),
                    "Schedule regenerated"
                );
                m.events.push(EngineEvent::ScheduleRegenerated {
                    loan_id,
                    entries: m.book.schedule.len(),
                    at: now,
                });
                Ok(())
            })
            .await?;

        Ok(Reconciled {
            value: book.schedule,
            warnings,
        })
    }

    /// Registers money tendered by a payer.
    ///
    /// With a `payment_number` the entry's open record moves to `pending`, or,
    /// if partial payments already closed that record, a follow-up record is
    /// created for the remainder. Without one an ad hoc principal prepayment
    /// record is created. Settlement happens through [`Self::transition`].
    pub async fn record_payment(
        &self,
        loan_id: LoanId,
        payment_number: Option<u32>,
        amount: Decimal,
        currency: &Currency,
        payment_date: DateTime<Utc>,
        source: PaymentSource,
    ) -> Result<PaymentRecord> {
        let tendered = Amount::new(amount)?.value();
        self.ensure_supported(currency)?;

        let (book, record_id, _) = self
            .mutate(loan_id, |m| {
                ensure_active(&m.book.loan)?;
                if *currency != m.book.loan.terms.currency {
                    return Err(EngineError::CurrencyMismatch {
                        expected: m.book.loan.terms.currency.clone(),
                        actual: currency.clone(),
                    });
                }
                match payment_number {
                    Some(number) => {
                        self.pay_entry(m, number, tendered, payment_date, source.clone())
                    }
                    None => prepay(m, tendered, payment_date, source.clone()),
                }
            })
            .await?;

        book.record(record_id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(record_id))
    }

    /// Applies a lifecycle event to one payment record.
    pub async fn transition(
        &self,
        record_id: RecordId,
        event: PaymentEvent,
    ) -> Result<Reconciled<PaymentRecord>> {
        let loan_id = self.locate(record_id).await?;
        let (book, (), warnings) = self
            .mutate(loan_id, |m| self.step(m, record_id, &event).map(|_| ()))
            .await?;

        let record = book
            .record(record_id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(record_id))?;
        Ok(Reconciled {
            value: record,
            warnings,
        })
    }

    /// Corrects the money fields of a record, keeping an audit entry. Later
    /// balances are re-derived by the ledger replay.
    pub async fn apply_adjustment(
        &self,
        record_id: RecordId,
        changes: AdjustmentChanges,
        reason: &str,
        actor: &str,
    ) -> Result<Reconciled<Adjusted>> {
        let loan_id = self.locate(record_id).await?;
        let (book, delta, warnings) = self
            .mutate(loan_id, |m| {
                let record = m
                    .book
                    .record(record_id)
                    .ok_or(EngineError::RecordNotFound(record_id))?;
                let (next, delta) = adjustment::apply(record, &changes, reason, actor, m.now)?;
                if let Some(slot) = m.book.record_mut(record_id) {
                    *slot = next;
                }
                m.adjusted = Some(record_id);
                m.focus = Some(record_id);

                info!(
                    loan_id = %loan_id,
                    record_id = %record_id,
                    actor,
                    reason,
                    principal_delta = %delta.principal,
                    interest_delta = %delta.interest,
                    fees_delta = %delta.fees,
                    "Payment record adjusted"
                );
                m.events.push(EngineEvent::RecordAdjusted {
                    loan_id,
                    record_id,
                    actor: actor.to_string(),
                    at: m.now,
                });
                Ok(delta)
            })
            .await?;

        let record = book
            .record(record_id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(record_id))?;
        Ok(Reconciled {
            value: Adjusted { record, delta },
            warnings,
        })
    }

    /// Cancels every open record of the loan and closes it. Settled history is
    /// left untouched. Cancelling an already cancelled loan is a no-op.
    pub async fn cancel_loan(&self, loan_id: LoanId, actor: &str, reason: &str) -> Result<Loan> {
        if actor.trim().is_empty() || reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "cancelling a loan requires an actor and a reason".to_string(),
            ));
        }
        let (book, (), _) = self
            .mutate(loan_id, |m| {
                match m.book.loan.status {
                    LoanStatus::Cancelled => return Ok(()),
                    LoanStatus::Repaid => {
                        return Err(EngineError::Validation(format!(
                            "loan {loan_id} is already repaid"
                        )));
                    }
                    LoanStatus::Active => {}
                }
                let open: Vec<RecordId> = m
                    .book
                    .records
                    .iter()
                    .filter(|r| r.status.is_open())
                    .map(|r| r.id)
                    .collect();
                let event = PaymentEvent::Cancel {
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                };
                for record_id in open {
                    self.step(m, record_id, &event)?;
                }
                m.book.loan.status = LoanStatus::Cancelled;

                info!(loan_id = %loan_id, actor, reason, "Loan cancelled");
                m.events.push(EngineEvent::LoanCancelled {
                    loan_id,
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                    at: m.now,
                });
                Ok(())
            })
            .await?;
        Ok(book.loan)
    }

    /// Advances time-driven work on every active loan: reached due dates move
    /// to `due`, failed records whose backoff elapsed go back to `pending`.
    /// Retried records are then claimed for processing; a record is returned
    /// only to the run that won its claim.
    ///
    /// A loan that fails is logged and skipped so the others still advance.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<PaymentRecord>> {
        let mut claimed = Vec::new();
        for loan_id in self.store.loan_ids().await? {
            match self.advance_loan(loan_id, now).await {
                Ok(records) => claimed.extend(records),
                Err(e) => warn!(
                    loan_id = %loan_id,
                    error = %e,
                    "Skipping loan in due and retry pass"
                ),
            }
        }
        Ok(claimed)
    }

    async fn advance_loan(&self, loan_id: LoanId, now: DateTime<Utc>) -> Result<Vec<PaymentRecord>> {
        let _guard = self.locks.acquire(loan_id).await;
        let Some(book) = self.store.get(loan_id).await? else {
            return Ok(Vec::new());
        };
        if book.loan.status != LoanStatus::Active {
            return Ok(Vec::new());
        }
        let work = retry::due_work(&book, now);
        if work.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = if work.has_transitions() {
            let (_, candidates, _) = self
                .mutate_locked(loan_id, Some(now), |m| {
                    let work = retry::due_work(&m.book, now);
                    for record_id in &work.mark_due {
                        self.step(m, *record_id, &PaymentEvent::MarkDue)?;
                    }
                    for record_id in &work.retry {
                        self.step(m, *record_id, &PaymentEvent::Retry)?;
                    }
                    Ok(work.claimable())
                })
                .await?;
            candidates
        } else {
            work.claimable()
        };

        let mut claimed = Vec::new();
        for record_id in candidates {
            let won = self
                .store
                .claim(
                    loan_id,
                    record_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Processing,
                )
                .await?;
            if !won {
                continue;
            }
            let Some(record) = self.store.get(loan_id).await?.and_then(|book| {
                book.record(record_id).cloned()
            }) else {
                continue;
            };
            info!(
                loan_id = %loan_id,
                record_id = %record_id,
                retry_count = record.retry_count,
                "Retry claimed for processing"
            );
            self.events.publish(EngineEvent::StatusChanged {
                loan_id,
                record_id,
                payment_number: record.payment_number,
                from: PaymentStatus::Pending,
                to: PaymentStatus::Processing,
                at: now,
            });
            claimed.push(record);
        }
        Ok(claimed)
    }

    pub async fn loan(&self, loan_id: LoanId) -> Result<Loan> {
        Ok(self.load(loan_id).await?.loan)
    }

    pub async fn schedule(&self, loan_id: LoanId) -> Result<Vec<ScheduleEntry>> {
        Ok(self.load(loan_id).await?.schedule)
    }

    pub async fn records(&self, loan_id: LoanId) -> Result<Vec<PaymentRecord>> {
        Ok(self.load(loan_id).await?.records)
    }

    pub async fn record(&self, record_id: RecordId) -> Result<PaymentRecord> {
        let loan_id = self.locate(record_id).await?;
        self.load(loan_id)
            .await?
            .record(record_id)
            .cloned()
            .ok_or(EngineError::RecordNotFound(record_id))
    }

    /// Every loan id known to the store.
    pub async fn loan_ids(&self) -> Result<Vec<LoanId>> {
        self.store.loan_ids().await
    }

    fn ensure_supported(&self, currency: &Currency) -> Result<()> {
        if self.currencies.is_supported(currency) {
            Ok(())
        } else {
            Err(EngineError::UnsupportedCurrency(currency.code().to_string()))
        }
    }

    async fn load(&self, loan_id: LoanId) -> Result<LoanBook> {
        self.store
            .get(loan_id)
            .await?
            .ok_or(EngineError::LoanNotFound(loan_id))
    }

    async fn locate(&self, record_id: RecordId) -> Result<LoanId> {
        self.store
            .locate(record_id)
            .await?
            .ok_or(EngineError::RecordNotFound(record_id))
    }

    async fn mutate<T, F>(
        &self,
        loan_id: LoanId,
        f: F,
    ) -> Result<(LoanBook, T, Vec<ReconciliationWarning>)>
    where
        F: FnMut(&mut Mutation) -> Result<T>,
    {
        let _guard = self.locks.acquire(loan_id).await;
        self.mutate_locked(loan_id, None, f).await
    }

    /// Runs `f` against a copy of the book and commits the result. The caller
    /// must hold the loan's lock.
    ///
    /// Another engine sharing the store may commit in between; `f` then runs
    /// again on the fresh book, up to [`MAX_COMMIT_ATTEMPTS`] times.
    async fn mutate_locked<T, F>(
        &self,
        loan_id: LoanId,
        at: Option<DateTime<Utc>>,
        mut f: F,
    ) -> Result<(LoanBook, T, Vec<ReconciliationWarning>)>
    where
        F: FnMut(&mut Mutation) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match self.try_mutate(loan_id, at, &mut f).await {
                Err(EngineError::VersionConflict { version, .. })
                    if attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    warn!(
                        loan_id = %loan_id,
                        version,
                        attempt,
                        "Loan changed concurrently, retrying"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_mutate<T, F>(
        &self,
        loan_id: LoanId,
        at: Option<DateTime<Utc>>,
        f: &mut F,
    ) -> Result<(LoanBook, T, Vec<ReconciliationWarning>)>
    where
        F: FnMut(&mut Mutation) -> Result<T>,
    {
        let before = self.load(loan_id).await?;
        let mut mutation = Mutation {
            book: before.clone(),
            now: at.unwrap_or_else(|| self.clock.now()),
            focus: None,
            adjusted: None,
            events: Vec::new(),
        };
        let value = f(&mut mutation)?;
        let Mutation {
            mut book,
            now,
            focus,
            adjusted,
            mut events,
        } = mutation;

        let warnings = ledger::reconcile(&mut book, focus, &self.config)?;
        ledger::ensure_history_preserved(&before, &book, adjusted)?;
        book.loan.updated_at = now;
        book.version = before.version + 1;
        self.store.commit(book.clone()).await?;

        if before.loan.status != LoanStatus::Repaid && book.loan.status == LoanStatus::Repaid {
            info!(loan_id = %loan_id, "Loan repaid");
            events.push(EngineEvent::LoanRepaid { loan_id, at: now });
        }
        events.extend(warnings.iter().cloned().map(EngineEvent::BalanceDiverged));
        for event in events {
            self.events.publish(event);
        }
        Ok((book, value, warnings))
    }

    /// Runs the state machine on one record inside a mutation.
    fn step(
        &self,
        m: &mut Mutation,
        record_id: RecordId,
        event: &PaymentEvent,
    ) -> Result<PaymentRecord> {
        let record = m
            .book
            .record(record_id)
            .ok_or(EngineError::RecordNotFound(record_id))?;
        let late_fee_charged_on_entry = record
            .payment_number
            .is_some_and(|n| m.book.late_fee_charged_on_entry(n, record_id));
        let ctx = TransitionContext {
            now: m.now,
            terms: &m.book.loan.terms,
            config: &self.config,
            outstanding_principal: m.book.loan.outstanding_principal.value(),
            late_fee_charged_on_entry,
        };
        let transition = state_machine::apply(record, event, &ctx)?;

        match transition.effect {
            Effect::Commit => m.focus = Some(record_id),
            Effect::ManualCollection => {
                warn!(
                    loan_id = %m.book.loan.id,
                    record_id = %record_id,
                    retry_count = transition.record.retry_count,
                    "Retries exhausted, manual collection required"
                );
                m.book.loan.manual_collection = true;
                m.events.push(EngineEvent::ManualCollectionRequired {
                    loan_id: m.book.loan.id,
                    record_id,
                    retry_count: transition.record.retry_count,
                    at: m.now,
                });
            }
            Effect::None => {}
        }
        if let Some(slot) = m.book.record_mut(record_id) {
            *slot = transition.record.clone();
        }
        m.status_changed(&transition.record, transition.from);
        Ok(transition.record)
    }

    /// Opens payment on schedule entry `number`.
    fn pay_entry(
        &self,
        m: &mut Mutation,
        number: u32,
        tendered: Decimal,
        paid_at: DateTime<Utc>,
        source: PaymentSource,
    ) -> Result<RecordId> {
        let loan_id = m.book.loan.id;
        let entry = m
            .book
            .entry(number)
            .cloned()
            .ok_or(EngineError::EntryNotFound {
                loan_id,
                payment_number: number,
            })?;

        let received = match m.book.entry_state(number) {
            EntryState::Satisfied => {
                return Err(EngineError::IllegalTransition {
                    from: PaymentStatus::Completed,
                    to: PaymentStatus::Pending,
                });
            }
            EntryState::Cancelled => {
                return Err(EngineError::IllegalTransition {
                    from: PaymentStatus::Cancelled,
                    to: PaymentStatus::Pending,
                });
            }
            EntryState::Open { received } => received,
        };

        if let Some(open) = m.book.open_record_for_entry(number) {
            let record_id = open.id;
            self.step(m, record_id, &PaymentEvent::Initiate)?;
            if let Some(record) = m.book.record_mut(record_id) {
                record.tendered_amount = Some(tendered);
                record.payment_date = Some(paid_at);
                record.source = source;
            }
            return Ok(record_id);
        }

        // Partial payments closed the previous records; pay the remainder.
        let partials: Vec<&PaymentRecord> = m
            .book
            .records_for_entry(number)
            .filter(|r| r.status == PaymentStatus::Partial)
            .collect();
        let charged: Decimal = partials
            .iter()
            .map(|r| r.late_fee_amount.unwrap_or_default() + r.early_payment_fee_amount)
            .sum();
        let previous = partials
            .iter()
            .max_by_key(|r| (r.settled_at, r.created_at))
            .map(|r| r.id);

        let mut record = match previous {
            Some(previous) => {
                let remaining = entry.total_due() + charged - received;
                PaymentRecord::follow_up(&entry, previous, remaining, tendered, m.now)
            }
            None => {
                let mut record = PaymentRecord::from_entry(&entry, m.now);
                record.status = PaymentStatus::Pending;
                record.tendered_amount = Some(tendered);
                record
            }
        };
        record.payment_date = Some(paid_at);
        record.source = source;

        info!(
            loan_id = %loan_id,
            record_id = %record.id,
            payment_number = number,
            amount = %record.amount,
            follow_up_of = ?record.follow_up_of,
            "Follow-up payment record created"
        );
        let record_id = record.id;
        m.book.records.push(record);
        Ok(record_id)
    }
}

/// Creates an ad hoc principal prepayment record.
fn prepay(
    m: &mut Mutation,
    tendered: Decimal,
    paid_at: DateTime<Utc>,
    source: PaymentSource,
) -> Result<RecordId> {
    let loan = &m.book.loan;
    if !loan.terms.allow_early_repayment {
        return Err(EngineError::Validation(format!(
            "loan {} does not allow early repayment",
            loan.id
        )));
    }
    let outstanding = loan.outstanding_principal.value();
    if outstanding <= Decimal::ZERO {
        return Err(EngineError::Validation(format!(
            "loan {} has no principal outstanding",
            loan.id
        )));
    }

    let record = PaymentRecord::ad_hoc(
        loan.id,
        tendered.min(outstanding),
        tendered,
        loan.terms.currency.clone(),
        paid_at,
        source,
        m.now,
    );
    info!(
        loan_id = %loan.id,
        record_id = %record.id,
        principal = %record.principal_amount,
        "Prepayment record created"
    );
    let record_id = record.id;
    m.book.records.push(record);
    Ok(record_id)
}

fn ensure_active(loan: &Loan) -> Result<()> {
    match loan.status {
        LoanStatus::Active => Ok(()),
        LoanStatus::Repaid => Err(EngineError::Validation(format!(
            "loan {} is already repaid",
            loan.id
        ))),
        LoanStatus::Cancelled => Err(EngineError::Validation(format!(
            "loan {} is cancelled",
            loan.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::terms::fixtures::monthly_terms;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::events::ChannelEventSink;
    use crate::domain::ports::LedgerStore;
    use crate::domain::terms::DurationMode;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
    }

    fn engine() -> (RepaymentEngine, ManualClock) {
        let clock = ManualClock::new(start());
        let engine = RepaymentEngine::new(
            Box::new(InMemoryLedgerStore::new()),
            EngineConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));
        (engine, clock)
    }

    fn activation() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
    }

    async fn settle(engine: &RepaymentEngine, record: &PaymentRecord, received: Decimal) -> PaymentRecord {
        engine
            .transition(
                record.id,
                PaymentEvent::BeginSettlement {
                    reference_number: record.reference_number.clone(),
                },
            )
            .await
            .unwrap();
        engine
            .transition(
                record.id,
                PaymentEvent::Settle {
                    received,
                    paid_at: None,
                },
            )
            .await
            .unwrap()
            .value
    }

    #[tokio::test]
    async fn test_activation_persists_book() {
        let (engine, _) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();

        assert_eq!(book.schedule.len(), 3);
        assert_eq!(book.records.len(), 3);
        assert!(book.records.iter().all(|r| r.status == PaymentStatus::Scheduled));
        let loan = engine.loan(book.loan.id).await.unwrap();
        assert_eq!(loan.outstanding_principal.value(), dec!(1000));
        assert_eq!(engine.schedule(book.loan.id).await.unwrap(), book.schedule);
    }

    #[tokio::test]
    async fn test_unsupported_currency_rejected() {
        let (engine, _) = engine();
        let mut terms = monthly_terms();
        terms.currency = Currency::parse("XYZ").unwrap();
        let result = engine.activate_loan(terms, activation()).await;
        assert!(matches!(result, Err(EngineError::UnsupportedCurrency(code)) if code == "XYZ"));
    }

    #[tokio::test]
    async fn test_pay_and_settle_first_entry() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let loan_id = book.loan.id;
        clock.set(start() + Duration::days(30));

        let record = engine
            .record_payment(
                loan_id,
                Some(1),
                book.schedule[0].total_due(),
                &book.loan.terms.currency,
                clock.now(),
                PaymentSource::PaymentMethod("card-1".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Pending);
        assert_eq!(record.id, book.records[0].id);

        let settled = settle(&engine, &record, record.amount).await;
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.principal_balance_after, Some(dec!(666.66)));
        let loan = engine.loan(loan_id).await.unwrap();
        assert_eq!(loan.outstanding_principal.value(), dec!(666.66));
    }

    #[tokio::test]
    async fn test_paying_settled_entry_is_illegal() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        clock.set(start() + Duration::days(30));
        let currency = book.loan.terms.currency.clone();
        let record = engine
            .record_payment(book.loan.id, Some(1), dec!(500), &currency, clock.now(), PaymentSource::Schedule)
            .await
            .unwrap();
        settle(&engine, &record, dec!(500)).await;

        let again = engine
            .record_payment(book.loan.id, Some(1), dec!(10), &currency, clock.now(), PaymentSource::Schedule)
            .await;
        assert!(matches!(
            again,
            Err(EngineError::IllegalTransition {
                from: PaymentStatus::Completed,
                to: PaymentStatus::Pending
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_entry_and_record() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();

        let result = engine
            .record_payment(book.loan.id, Some(9), dec!(10), &currency, clock.now(), PaymentSource::Schedule)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::EntryNotFound { payment_number: 9, .. })
        ));
        let missing = RecordId::generate();
        assert!(matches!(
            engine.transition(missing, PaymentEvent::Initiate).await,
            Err(EngineError::RecordNotFound(id)) if id == missing
        ));
        assert!(matches!(
            engine.loan(LoanId::generate()).await,
            Err(EngineError::LoanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prepayment_reduces_principal() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();

        let record = engine
            .record_payment(book.loan.id, None, dec!(200), &currency, clock.now(), PaymentSource::Manual("teller".to_string()))
            .await
            .unwrap();
        assert_eq!(record.payment_number, None);
        assert_eq!(record.principal_amount, dec!(200));

        let settled = settle(&engine, &record, dec!(200)).await;
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.principal_balance_after, Some(dec!(800)));
    }

    #[tokio::test]
    async fn test_prepayment_refused_when_not_allowed() {
        let (engine, clock) = engine();
        let mut terms = monthly_terms();
        terms.allow_early_repayment = false;
        let book = engine.activate_loan(terms, activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();

        let result = engine
            .record_payment(book.loan.id, None, dec!(200), &currency, clock.now(), PaymentSource::Schedule)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_events_follow_commit() {
        let (sink, mut rx) = ChannelEventSink::new();
        let (engine, clock) = engine();
        let engine = engine.with_event_sink(Arc::new(sink));
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();

        assert!(matches!(rx.recv().await, Some(EngineEvent::LoanActivated { entries: 3, .. })));
        engine
            .record_payment(book.loan.id, Some(1), dec!(400), &currency, clock.now(), PaymentSource::Schedule)
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::StatusChanged {
                from: PaymentStatus::Scheduled,
                to: PaymentStatus::Pending,
                ..
            })
        ));

        // A rejected mutation publishes nothing.
        let failed = engine
            .record_payment(book.loan.id, Some(1), dec!(400), &currency, clock.now(), PaymentSource::Schedule)
            .await;
        assert!(failed.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_loan_keeps_settled_history() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();
        clock.set(start() + Duration::days(30));
        let record = engine
            .record_payment(book.loan.id, Some(1), dec!(500), &currency, clock.now(), PaymentSource::Schedule)
            .await
            .unwrap();
        let settled = settle(&engine, &record, dec!(500)).await;

        let loan = engine.cancel_loan(book.loan.id, "ops", "borrower deceased").await.unwrap();
        assert_eq!(loan.status, LoanStatus::Cancelled);

        let records = engine.records(book.loan.id).await.unwrap();
        assert_eq!(records[0].snapshot(), settled.snapshot());
        assert!(records[1..].iter().all(|r| r.status == PaymentStatus::Cancelled));

        let again = engine.cancel_loan(book.loan.id, "ops", "duplicate").await.unwrap();
        assert_eq!(again.status, LoanStatus::Cancelled);
        let refused = engine
            .record_payment(book.loan.id, Some(2), dec!(10), &currency, clock.now(), PaymentSource::Schedule)
            .await;
        assert!(matches!(refused, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_regenerate_replaces_unsettled_entries() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let currency = book.loan.terms.currency.clone();
        clock.set(start() + Duration::days(30));
        let record = engine
            .record_payment(book.loan.id, Some(1), dec!(500), &currency, clock.now(), PaymentSource::Schedule)
            .await
            .unwrap();
        settle(&engine, &record, dec!(500)).await;

        let mut terms = monthly_terms();
        terms.interest_rate = dec!(20);
        let regenerated = engine.regenerate_schedule(book.loan.id, terms).await.unwrap();

        assert_eq!(regenerated.value[0], book.schedule[0]);
        assert!(regenerated.value[1].expected_interest > book.schedule[1].expected_interest);
        let records = engine.records(book.loan.id).await.unwrap();
        assert_eq!(records.len(), 3);
        let second = records.iter().find(|r| r.payment_number == Some(2)).unwrap();
        assert_ne!(second.id, book.records[1].id);
        assert_eq!(second.interest_amount, regenerated.value[1].expected_interest);
    }

    #[tokio::test]
    async fn test_regenerate_with_same_terms_changes_nothing() {
        let (engine, _) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();

        let regenerated = engine
            .regenerate_schedule(book.loan.id, monthly_terms())
            .await
            .unwrap();
        assert_eq!(regenerated.value, book.schedule);
        let ids: Vec<RecordId> = engine.records(book.loan.id).await.unwrap().iter().map(|r| r.id).collect();
        let original: Vec<RecordId> = book.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, original);
    }

    async fn pay_in_full(engine: &RepaymentEngine, book: &LoanBook, number: u32) -> PaymentRecord {
        let entry = &book.schedule[number as usize - 1];
        let record = engine
            .record_payment(
                book.loan.id,
                Some(number),
                entry.total_due(),
                &book.loan.terms.currency,
                start() + Duration::days(30),
                PaymentSource::Schedule,
            )
            .await
            .unwrap();
        settle(engine, &record, record.amount).await
    }

    fn six_months() -> LoanTerms {
        let mut terms = monthly_terms();
        terms.duration = DurationMode::Fixed { days: 180 };
        terms.chosen_duration_days = 180;
        terms
    }

    #[tokio::test]
    async fn test_regenerate_longer_term_keeps_principal() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        clock.set(start() + Duration::days(30));
        pay_in_full(&engine, &book, 1).await;

        let regenerated = engine
            .regenerate_schedule(book.loan.id, six_months())
            .await
            .unwrap()
            .value;
        assert_eq!(regenerated.len(), 6);
        assert_eq!(regenerated[0], book.schedule[0]);
        let principal: Decimal = regenerated.iter().map(|e| e.expected_principal).sum();
        assert_eq!(principal, dec!(1000));
        assert!(
            regenerated
                .windows(2)
                .all(|w| w[1].expected_balance_after < w[0].expected_balance_after)
        );

        let records = engine.records(book.loan.id).await.unwrap();
        assert_eq!(records.len(), 6);
        let loan = engine.loan(book.loan.id).await.unwrap();
        assert_eq!(loan.outstanding_principal.value(), dec!(666.66));
    }

    #[tokio::test]
    async fn test_regenerate_refuses_to_drop_cancelled_entries() {
        let (engine, _) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        engine
            .transition(
                book.records[2].id,
                PaymentEvent::Cancel {
                    actor: "ops".to_string(),
                    reason: "restructured".to_string(),
                },
            )
            .await
            .unwrap();

        let mut shorter = monthly_terms();
        shorter.duration = DurationMode::Fixed { days: 60 };
        shorter.chosen_duration_days = 60;
        match engine.regenerate_schedule(book.loan.id, shorter).await {
            Err(EngineError::ScheduleConflict {
                payment_numbers, ..
            }) => assert_eq!(payment_numbers, vec![3]),
            other => panic!("expected schedule conflict, got {other:?}"),
        }
        assert_eq!(engine.schedule(book.loan.id).await.unwrap(), book.schedule);
    }

    struct EurosOnly;

    impl CurrencyRegistry for EurosOnly {
        fn is_supported(&self, currency: &Currency) -> bool {
            currency.code() == "EUR"
        }
    }

    #[tokio::test]
    async fn test_custom_currency_registry() {
        let (engine, _) = engine();
        let engine = engine.with_currency_registry(Arc::new(EurosOnly));

        let result = engine.activate_loan(monthly_terms(), activation()).await;
        assert!(matches!(result, Err(EngineError::UnsupportedCurrency(code)) if code == "USD"));

        let mut terms = monthly_terms();
        terms.currency = Currency::parse("EUR").unwrap();
        let book = engine.activate_loan(terms, activation()).await.unwrap();
        assert_eq!(book.loan.terms.currency.code(), "EUR");
    }

    #[tokio::test]
    async fn test_due_pass_skips_broken_loan() {
        let store = InMemoryLedgerStore::new();
        let clock = ManualClock::new(start());
        let engine = RepaymentEngine::new(Box::new(store.clone()), EngineConfig::default())
            .with_clock(Arc::new(clock.clone()));
        let broken = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        let healthy = engine.activate_loan(monthly_terms(), activation()).await.unwrap();

        let mut corrupted = broken.clone();
        corrupted.schedule[2].currency = Currency::parse("EUR").unwrap();
        corrupted.version = broken.version + 1;
        store.commit(corrupted).await.unwrap();

        let now = start() + Duration::days(30);
        engine.run_due_retries(now).await.unwrap();

        let records = engine.records(healthy.loan.id).await.unwrap();
        assert_eq!(records[0].status, PaymentStatus::Due);
        let records = engine.records(broken.loan.id).await.unwrap();
        assert_eq!(records[0].status, PaymentStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_due_pass_reclaims_stranded_retry() {
        let (engine, clock) = engine();
        let book = engine.activate_loan(monthly_terms(), activation()).await.unwrap();
        clock.set(start() + Duration::days(30));
        let record = engine
            .record_payment(
                book.loan.id,
                Some(1),
                book.schedule[0].total_due(),
                &book.loan.terms.currency,
                clock.now(),
                PaymentSource::Schedule,
            )
            .await
            .unwrap();
        engine
            .transition(
                record.id,
                PaymentEvent::BeginSettlement {
                    reference_number: record.reference_number.clone(),
                },
            )
            .await
            .unwrap();
        let failed = engine
            .transition(
                record.id,
                PaymentEvent::Reject {
                    reason: "timeout".to_string(),
                },
            )
            .await
            .unwrap()
            .value;
        let retry_at = failed.next_retry_at.unwrap();
        clock.set(retry_at);
        // Retried but never claimed.
        let pending = engine
            .transition(record.id, PaymentEvent::Retry)
            .await
            .unwrap()
            .value;
        assert_eq!(pending.status, PaymentStatus::Pending);

        let claimed = engine.run_due_retries(retry_at).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, record.id);
        assert_eq!(claimed[0].status, PaymentStatus::Processing);
        assert!(engine.run_due_retries(retry_at).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_engines_sharing_a_store_do_not_lose_updates() {
        let store = InMemoryLedgerStore::new();
        let clock = ManualClock::new(start() + Duration::days(30));
        let first = Arc::new(
            RepaymentEngine::new(Box::new(store.clone()), EngineConfig::default())
                .with_clock(Arc::new(clock.clone())),
        );
        let second = Arc::new(
            RepaymentEngine::new(Box::new(store.clone()), EngineConfig::default())
                .with_clock(Arc::new(clock.clone())),
        );

        for _ in 0..10 {
            let book = first.activate_loan(monthly_terms(), activation()).await.unwrap();
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let engine = first.clone();
                    let book = book.clone();
                    async move { pay_in_full(&engine, &book, 1).await }
                }),
                tokio::spawn({
                    let engine = second.clone();
                    let book = book.clone();
                    async move { pay_in_full(&engine, &book, 2).await }
                }),
            );
            assert_eq!(a.unwrap().status, PaymentStatus::Completed);
            assert_eq!(b.unwrap().status, PaymentStatus::Completed);

            let records = first.records(book.loan.id).await.unwrap();
            assert_eq!(records[0].status, PaymentStatus::Completed);
            assert_eq!(records[1].status, PaymentStatus::Completed);
            let loan = second.loan(book.loan.id).await.unwrap();
            assert_eq!(loan.outstanding_principal.value(), dec!(333.33));
        }
    }
}
