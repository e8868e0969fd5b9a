mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use repayment_engine::config::EngineConfig;
use repayment_engine::domain::LoanId;
use repayment_engine::domain::schedule::{ScheduleEntry, generate};
use repayment_engine::domain::terms::{
    DurationMode, InterestType, LoanTerms, PaymentFrequency, TimeUnit,
};
use rust_decimal::Decimal;
use std::collections::BTreeSet;

const FREQUENCIES: [PaymentFrequency; 6] = [
    PaymentFrequency::Daily,
    PaymentFrequency::Weekly,
    PaymentFrequency::Monthly,
    PaymentFrequency::Quarterly,
    PaymentFrequency::Yearly,
    PaymentFrequency::EndOfTerm,
];

const UNITS: [TimeUnit; 4] = [
    TimeUnit::Daily,
    TimeUnit::Weekly,
    TimeUnit::Monthly,
    TimeUnit::Yearly,
];

fn random_terms(rng: &mut StdRng) -> LoanTerms {
    let payment_frequency = FREQUENCIES[rng.gen_range(0..FREQUENCIES.len())];
    let interest_calculation = UNITS[rng.gen_range(0..UNITS.len())];
    let period = payment_frequency
        .days()
        .unwrap_or(interest_calculation.days());
    let days = period * rng.gen_range(1..=12) + rng.gen_range(0..period);
    LoanTerms {
        principal: Decimal::new(rng.gen_range(10_000..100_000_000), 2),
        interest_rate: Decimal::new(rng.gen_range(0..3_600), 2),
        rate_unit: TimeUnit::Yearly,
        interest_type: if rng.gen_bool(0.5) {
            InterestType::Simple
        } else {
            InterestType::Compound
        },
        interest_calculation,
        payment_frequency,
        duration: DurationMode::Fixed { days },
        chosen_duration_days: days,
        origination_fee: Decimal::new(rng.gen_range(0..5_000), 2),
        ..monthly_terms()
    }
}

fn check(terms: &LoanTerms, entries: &[ScheduleEntry]) {
    let principal: Decimal = entries.iter().map(|e| e.expected_principal).sum();
    assert_eq!(principal, terms.principal, "principal must be fully amortized");

    let numbers: Vec<u32> = entries.iter().map(|e| e.payment_number).collect();
    let dense: Vec<u32> = (1..=entries.len() as u32).collect();
    assert_eq!(numbers, dense);

    let mut previous = terms.principal;
    for entry in entries {
        assert!(entry.expected_balance_after <= previous);
        assert!(entry.expected_principal >= Decimal::ZERO);
        assert!(entry.expected_interest >= Decimal::ZERO);
        assert!(entry.expected_principal.scale() <= 2);
        assert!(entry.expected_interest.scale() <= 2);
        previous = entry.expected_balance_after;
    }
    assert_eq!(previous, Decimal::ZERO);

    let dates: BTreeSet<_> = entries.iter().map(|e| e.due_date).collect();
    assert_eq!(dates.len(), entries.len(), "due dates must be strictly increasing");
    let span: u32 = entries.iter().map(|e| e.days_in_period).sum();
    assert_eq!(span, terms.chosen_duration_days);

    if terms.is_end_of_term() {
        assert!(entries[..entries.len() - 1]
            .iter()
            .all(|e| e.expected_principal.is_zero()));
    }
}

#[test]
fn test_random_terms_amortize_fully() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let config = EngineConfig::default();
    for _ in 0..300 {
        let terms = random_terms(&mut rng);
        let entries = generate(LoanId::generate(), &terms, activation(), &config)
            .unwrap_or_else(|e| panic!("{terms:?} failed: {e}"));
        check(&terms, &entries);
    }
}

#[test]
fn test_generation_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = EngineConfig::default();
    for _ in 0..50 {
        let terms = random_terms(&mut rng);
        let loan_id = LoanId::generate();
        let first = generate(loan_id, &terms, activation(), &config).unwrap();
        let second = generate(loan_id, &terms, activation(), &config).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
