//! Loan package terms.
//!
//! Terms are immutable for the life of a loan unless explicitly amended
//! through schedule regeneration.

use super::money::{Currency, MAX_AMOUNT, percent, round_money};
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    Simple,
    Compound,
}

/// Unit used both for quoting a rate and for interest calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl TimeUnit {
    pub fn days(self) -> u32 {
        match self {
            TimeUnit::Daily => 1,
            TimeUnit::Weekly => 7,
            TimeUnit::Monthly => 30,
            TimeUnit::Yearly => 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    /// Interest-only periods with the whole principal due on the last one.
    EndOfTerm,
}

impl PaymentFrequency {
    /// Period length in days; `None` for end-of-term, whose periods follow the
    /// interest calculation unit.
    pub fn days(self) -> Option<u32> {
        match self {
            PaymentFrequency::Daily => Some(1),
            PaymentFrequency::Weekly => Some(7),
            PaymentFrequency::Monthly => Some(30),
            PaymentFrequency::Quarterly => Some(90),
            PaymentFrequency::Yearly => Some(365),
            PaymentFrequency::EndOfTerm => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DurationMode {
    Fixed { days: u32 },
    Range { min_days: u32, max_days: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LateFee {
    pub fixed: Decimal,
    /// Percentage of the amount due.
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub principal: Decimal,
    pub currency: Currency,
    /// Percentage rate quoted per `rate_unit`.
    pub interest_rate: Decimal,
    #[serde(default = "default_rate_unit")]
    pub rate_unit: TimeUnit,
    pub interest_type: InterestType,
    pub interest_calculation: TimeUnit,
    pub payment_frequency: PaymentFrequency,
    pub duration: DurationMode,
    pub chosen_duration_days: u32,
    #[serde(default)]
    pub grace_period_days: u32,
    #[serde(default)]
    pub late_fee: LateFee,
    #[serde(default)]
    pub early_payment_fee_percentage: Decimal,
    #[serde(default = "default_allow_early")]
    pub allow_early_repayment: bool,
    #[serde(default)]
    pub origination_fee: Decimal,
    #[serde(default)]
    pub platform_fee_percentage: Decimal,
}

fn default_rate_unit() -> TimeUnit {
    TimeUnit::Yearly
}

fn default_allow_early() -> bool {
    true
}

impl LoanTerms {
    /// Checks every field that does not depend on period resolution.
    pub fn validate(&self) -> Result<()> {
        if self.principal <= Decimal::ZERO {
            return Err(invalid(format!(
                "principal must be positive, got {}",
                self.principal
            )));
        }
        if self.principal > MAX_AMOUNT {
            return Err(invalid(format!(
                "principal {} exceeds the maximum of {MAX_AMOUNT}",
                self.principal
            )));
        }
        if self.interest_rate < Decimal::ZERO {
            return Err(invalid(format!(
                "interest rate must not be negative, got {}",
                self.interest_rate
            )));
        }
        for (name, value) in [
            ("late fee percentage", self.late_fee.percentage),
            ("early payment fee percentage", self.early_payment_fee_percentage),
            ("platform fee percentage", self.platform_fee_percentage),
        ] {
            if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
                return Err(invalid(format!("{name} must be within 0..=100, got {value}")));
            }
        }
        for (name, value) in [
            ("fixed late fee", self.late_fee.fixed),
            ("origination fee", self.origination_fee),
        ] {
            if value < Decimal::ZERO || value > MAX_AMOUNT {
                return Err(invalid(format!(
                    "{name} must be within 0..={MAX_AMOUNT}, got {value}"
                )));
            }
        }
        if self.chosen_duration_days == 0 {
            return Err(invalid("duration must be at least one day".to_string()));
        }
        match self.duration {
            DurationMode::Fixed { days } if days != self.chosen_duration_days => {
                Err(invalid(format!(
                    "chosen duration {} differs from fixed duration {days}",
                    self.chosen_duration_days
                )))
            }
            DurationMode::Range { min_days, max_days } if min_days > max_days => Err(invalid(
                format!("duration range {min_days}..{max_days} is empty"),
            )),
            DurationMode::Range { min_days, max_days }
                if !(min_days..=max_days).contains(&self.chosen_duration_days) =>
            {
                Err(invalid(format!(
                    "chosen duration {} is outside {min_days}..={max_days}",
                    self.chosen_duration_days
                )))
            }
            _ => Ok(()),
        }
    }

    /// Length in days of a regular (non-final) payment period.
    pub fn period_length_days(&self) -> u32 {
        self.payment_frequency
            .days()
            .unwrap_or_else(|| self.interest_calculation.days())
    }

    pub fn is_end_of_term(&self) -> bool {
        self.payment_frequency == PaymentFrequency::EndOfTerm
    }

    /// Rate applied per interest-calculation sub-interval, as a fraction.
    ///
    /// A rate quoted in the calculation unit is used as-is; otherwise it is
    /// annualized and scaled by `calc_days / 365`.
    pub fn sub_interval_rate(&self) -> Result<Decimal> {
        let quoted = percent(self.interest_rate);
        if self.interest_calculation == self.rate_unit {
            return Ok(quoted);
        }
        let year = Decimal::from(TimeUnit::Yearly.days());
        quoted
            .checked_mul(year)
            .map(|annual| annual / Decimal::from(self.rate_unit.days()))
            .and_then(|annual| annual.checked_mul(Decimal::from(self.interest_calculation.days())))
            .map(|rate| rate / year)
            .ok_or_else(|| invalid(format!("interest rate {} overflows", self.interest_rate)))
    }

    /// Fee charged once at origination, carried by the first entry.
    pub fn origination_fee_amount(&self, scale: u32) -> Result<Decimal> {
        percent(self.platform_fee_percentage)
            .checked_mul(self.principal)
            .and_then(|platform| platform.checked_add(self.origination_fee))
            .map(|fee| round_money(fee, scale))
            .ok_or_else(|| invalid("origination fee overflows".to_string()))
    }
}

fn invalid(message: String) -> EngineError {
    EngineError::InvalidTerms(message)
}
