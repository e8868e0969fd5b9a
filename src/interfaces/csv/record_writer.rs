use crate::domain::payment::{PaymentRecord, PaymentStatus};
use crate::error::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct RecordRow<'a> {
    reference_number: &'a str,
    payment_number: Option<u32>,
    status: PaymentStatus,
    due_date: NaiveDate,
    amount: Decimal,
    principal: Decimal,
    interest: Decimal,
    fee: Decimal,
    late_fee: Option<Decimal>,
    early_payment_fee: Decimal,
    received: Decimal,
    retry_count: u32,
    principal_balance_after: Option<Decimal>,
}

impl<'a> From<&'a PaymentRecord> for RecordRow<'a> {
    fn from(record: &'a PaymentRecord) -> Self {
        Self {
            reference_number: &record.reference_number,
            payment_number: record.payment_number,
            status: record.status,
            due_date: record.due_date,
            amount: record.amount,
            principal: record.principal_amount,
            interest: record.interest_amount,
            fee: record.fee_amount,
            late_fee: record.late_fee_amount,
            early_payment_fee: record.early_payment_fee_amount,
            received: record.amount_received,
            retry_count: record.retry_count,
            principal_balance_after: record.principal_balance_after,
        }
    }
}

/// Writes payment records as CSV, one row per record.
pub struct RecordWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_records<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a PaymentRecord>,
    ) -> Result<()> {
        for record in records {
            self.writer.serialize(RecordRow::from(record))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
