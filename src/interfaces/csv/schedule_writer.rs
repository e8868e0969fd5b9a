use crate::domain::schedule::ScheduleEntry;
use crate::error::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ScheduleRow {
    payment_number: u32,
    due_date: NaiveDate,
    days_in_period: u32,
    principal: Decimal,
    interest: Decimal,
    fee: Decimal,
    total: Decimal,
    balance_after: Decimal,
}

impl From<&ScheduleEntry> for ScheduleRow {
    fn from(entry: &ScheduleEntry) -> Self {
        Self {
            payment_number: entry.payment_number,
            due_date: entry.due_date,
            days_in_period: entry.days_in_period,
            principal: entry.expected_principal,
            interest: entry.expected_interest,
            fee: entry.expected_fee,
            total: entry.total_due(),
            balance_after: entry.expected_balance_after,
        }
    }
}

/// Writes a repayment schedule as CSV.
pub struct ScheduleWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ScheduleWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_schedule(&mut self, entries: &[ScheduleEntry]) -> Result<()> {
        for entry in entries {
            self.writer.serialize(ScheduleRow::from(entry))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::LoanId;
    use crate::domain::schedule::generate;
    use crate::domain::terms::fixtures::monthly_terms;

    #[test]
    fn test_writes_header_and_rows() {
        let activation = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let entries = generate(
            LoanId::generate(),
            &monthly_terms(),
            activation,
            &EngineConfig::default(),
        )
        .unwrap();

        let mut out = Vec::new();
        ScheduleWriter::new(&mut out).write_schedule(&entries).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "payment_number,due_date,days_in_period,principal,interest,fee,total,balance_after"
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("1,2026-01-31,30,333.34,"));
        let last_balance = lines[3].rsplit(',').next().unwrap();
        assert_eq!(last_balance.parse::<Decimal>().unwrap(), Decimal::ZERO);
    }
}
