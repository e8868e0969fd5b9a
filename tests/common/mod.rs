#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use repayment_engine::application::engine::RepaymentEngine;
use repayment_engine::config::EngineConfig;
use repayment_engine::domain::loan::LoanBook;
use repayment_engine::domain::money::Currency;
use repayment_engine::domain::payment::{PaymentRecord, PaymentSource};
use repayment_engine::domain::state_machine::PaymentEvent;
use repayment_engine::domain::terms::{
    DurationMode, InterestType, LateFee, LoanTerms, PaymentFrequency, TimeUnit,
};
use repayment_engine::infrastructure::clock::ManualClock;
use repayment_engine::infrastructure::in_memory::InMemoryLedgerStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub fn activation() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap()
}

/// Midday on the given day after activation.
pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::days(n)
}

pub fn usd() -> Currency {
    Currency::parse("USD").unwrap()
}

/// 1000 USD at 10% a year, simple interest computed monthly, repaid monthly
/// over 90 days.
pub fn monthly_terms() -> LoanTerms {
    LoanTerms {
        principal: dec!(1000),
        currency: usd(),
        interest_rate: dec!(10),
        rate_unit: TimeUnit::Yearly,
        interest_type: InterestType::Simple,
        interest_calculation: TimeUnit::Monthly,
        payment_frequency: PaymentFrequency::Monthly,
        duration: DurationMode::Fixed { days: 90 },
        chosen_duration_days: 90,
        grace_period_days: 3,
        late_fee: LateFee {
            fixed: dec!(5),
            percentage: dec!(2),
        },
        early_payment_fee_percentage: Decimal::ZERO,
        allow_early_repayment: true,
        origination_fee: Decimal::ZERO,
        platform_fee_percentage: Decimal::ZERO,
    }
}

/// A single 30-day period of exactly `principal`, no interest.
pub fn single_period_terms(principal: Decimal) -> LoanTerms {
    LoanTerms {
        principal,
        interest_rate: Decimal::ZERO,
        duration: DurationMode::Fixed { days: 30 },
        chosen_duration_days: 30,
        ..monthly_terms()
    }
}

pub fn engine_with(config: EngineConfig) -> (RepaymentEngine, ManualClock) {
    let clock = ManualClock::new(start());
    let engine = RepaymentEngine::new(Box::new(InMemoryLedgerStore::new()), config)
        .with_clock(Arc::new(clock.clone()));
    (engine, clock)
}

pub fn engine() -> (RepaymentEngine, ManualClock) {
    engine_with(EngineConfig::default())
}

pub async fn activate(engine: &RepaymentEngine, terms: LoanTerms) -> LoanBook {
    engine.activate_loan(terms, activation()).await.unwrap()
}

pub async fn pay(
    engine: &RepaymentEngine,
    book: &LoanBook,
    payment_number: Option<u32>,
    amount: Decimal,
    at: DateTime<Utc>,
) -> PaymentRecord {
    engine
        .record_payment(
            book.loan.id,
            payment_number,
            amount,
            &book.loan.terms.currency,
            at,
            PaymentSource::PaymentMethod("pm-test".to_string()),
        )
        .await
        .unwrap()
}

pub async fn begin(engine: &RepaymentEngine, record: &PaymentRecord) -> PaymentRecord {
    engine
        .transition(
            record.id,
            PaymentEvent::BeginSettlement {
                reference_number: record.reference_number.clone(),
            },
        )
        .await
        .unwrap()
        .value
}

pub async fn settle(
    engine: &RepaymentEngine,
    record: &PaymentRecord,
    received: Decimal,
) -> PaymentRecord {
    begin(engine, record).await;
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

pub async fn reject(engine: &RepaymentEngine, record: &PaymentRecord, reason: &str) -> PaymentRecord {
    engine
        .transition(
            record.id,
            PaymentEvent::Reject {
                reason: reason.to_string(),
            },
        )
        .await
        .unwrap()
        .value
}

/// Writes a payment command CSV that pays and settles the first `entries`
/// schedule entries on their due dates, `amount` each.
pub fn generate_commands_csv(path: &Path, entries: u32, amount: &str) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["type", "payment_number", "amount", "at", "reason"])?;
    for n in 1..=entries {
        let at = day(i64::from(n) * 30).to_rfc3339();
        let number = n.to_string();
        wtr.write_record(["pay", number.as_str(), amount, at.as_str(), ""])?;
        wtr.write_record(["settle", number.as_str(), amount, at.as_str(), ""])?;
    }

    wtr.flush()?;
    Ok(())
}
