use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Tender money for an entry, or a prepayment when no entry is given.
    Pay,
    /// Settle the pending payment with `amount` received.
    Settle,
    /// Reject the pending payment.
    Fail,
    /// Forgive an entry.
    Waive,
    /// Run the retry scheduler at `at`.
    Tick,
    /// Cancel the whole loan.
    Cancel,
}

/// One row of a payment simulation file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentCommand {
    #[serde(rename = "type")]
    pub r#type: CommandType,
    pub payment_number: Option<u32>,
    pub amount: Option<Decimal>,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Reads payment commands from a CSV source.
///
/// Columns are `type, payment_number, amount, at, reason`; `at` is an RFC 3339
/// instant. Whitespace is trimmed and short rows are accepted.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands, one `Result` per row.
    pub fn commands(self) -> impl Iterator<Item = Result<PaymentCommand>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "type, payment_number, amount, at, reason\n\
                    pay, 1, 341.56, 2026-01-31T10:00:00Z,\n\
                    fail, 1, , 2026-01-31T11:00:00Z, insufficient funds\n\
                    pay, , 100, 2026-02-01T00:00:00Z,";
        let reader = CommandReader::new(data.as_bytes());
        let commands: Vec<PaymentCommand> = reader.commands().map(|c| c.unwrap()).collect();

        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].r#type, CommandType::Pay);
        assert_eq!(commands[0].payment_number, Some(1));
        assert_eq!(commands[0].amount, Some(dec!(341.56)));
        assert_eq!(commands[1].reason.as_deref(), Some("insufficient funds"));
        assert_eq!(commands[1].amount, None);
        assert_eq!(commands[2].payment_number, None);
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "type, payment_number, amount, at, reason\nrefund, 1, 1.0, 2026-01-01T00:00:00Z,";
        let reader = CommandReader::new(data.as_bytes());
        let results: Vec<Result<PaymentCommand>> = reader.commands().collect();

        assert!(matches!(results[0], Err(EngineError::Csv(_))));
    }
}
