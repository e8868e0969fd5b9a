//! Engine configuration.
//!
//! `EngineConfig` is an immutable value handed to every calculation. Nothing in
//! the engine reads settings from ambient state.

use crate::domain::money::Currency;
use crate::error::Result;
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest delay a retry policy may ask for: one year.
pub const MAX_BACKOFF_SECS: i64 = 365 * 24 * 60 * 60;

/// Capped exponential backoff for failed settlements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
    /// Maximum number of failed attempts a record may accumulate.
    pub max_retry_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff_secs: 60,
            max_backoff_secs: 3600,
            max_retry_count: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt given the number of failures so far.
    ///
    /// `min(base * 2^retry_count, max)`; the exponent saturates instead of
    /// overflowing and the result never exceeds [`MAX_BACKOFF_SECS`].
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = if retry_count >= 62 {
            i64::MAX
        } else {
            1_i64 << retry_count
        };
        let secs = self
            .base_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs)
            .clamp(0, MAX_BACKOFF_SECS);
        Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decimal places every money amount is rounded to.
    pub amount_scale: u32,
    pub retry: RetryPolicy,
    /// Allowed gap between projected and actual balances before a
    /// reconciliation warning is raised.
    pub reconciliation_epsilon: Decimal,
    pub supported_currencies: Vec<Currency>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            amount_scale: 2,
            retry: RetryPolicy::default(),
            reconciliation_epsilon: dec!(0.01),
            supported_currencies: ["USD", "EUR", "GBP", "NGN", "KES", "GHS", "ZAR", "JPY", "CAD"]
                .iter()
                .filter_map(|code| Currency::parse(code).ok())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Loads a JSON configuration file. Missing keys fall back to defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: EngineConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        use crate::error::EngineError;

        if self.amount_scale > 10 {
            return Err(EngineError::Validation(format!(
                "amount_scale {} is out of range",
                self.amount_scale
            )));
        }
        if self.retry.base_backoff_secs <= 0
            || self.retry.max_backoff_secs < self.retry.base_backoff_secs
        {
            return Err(EngineError::Validation(
                "retry backoff must be positive and base <= max".to_string(),
            ));
        }
        if self.retry.max_backoff_secs > MAX_BACKOFF_SECS {
            return Err(EngineError::Validation(format!(
                "max_backoff_secs {} exceeds {MAX_BACKOFF_SECS}",
                self.retry.max_backoff_secs
            )));
        }
        if self.reconciliation_epsilon < Decimal::ZERO {
            return Err(EngineError::Validation(
                "reconciliation_epsilon must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Smallest representable money step at the configured scale.
    pub fn minor_unit(&self) -> Decimal {
        Decimal::new(1, self.amount_scale)
    }
}
