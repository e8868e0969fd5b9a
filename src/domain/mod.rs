//! Domain layer: loan terms, schedules, payment records and the pure
//! calculations over them.
//!
//! Nothing in here performs I/O. Persistence, time and outbound events are
//! reached through the traits in [`ports`].

pub mod adjustment;
pub mod events;
pub mod fees;
pub mod ledger;
pub mod loan;
pub mod money;
pub mod payment;
pub mod ports;
pub mod schedule;
pub mod state_machine;
pub mod terms;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoanId(pub Uuid);

impl LoanId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
