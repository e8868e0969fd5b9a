use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use repayment_engine::application::engine::RepaymentEngine;
use repayment_engine::config::EngineConfig;
use repayment_engine::domain::LoanId;
use repayment_engine::domain::ports::LedgerStoreBox;
use repayment_engine::domain::terms::LoanTerms;
use repayment_engine::infrastructure::clock::ManualClock;
use repayment_engine::infrastructure::in_memory::InMemoryLedgerStore;
use repayment_engine::interfaces::csv::command_reader::CommandReader;
use repayment_engine::interfaces::csv::record_writer::RecordWriter;
use repayment_engine::interfaces::csv::schedule_writer::ScheduleWriter;
use repayment_engine::interfaces::simulation::Simulation;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration JSON file (optional). Defaults apply otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the repayment schedule for a set of loan terms as CSV.
    Schedule {
        /// Loan terms JSON file
        #[arg(long)]
        terms: PathBuf,
        /// Activation date (YYYY-MM-DD)
        #[arg(long)]
        activation: NaiveDate,
    },
    /// Activate a loan, replay payment commands against it and print the
    /// resulting payment records as CSV.
    Simulate {
        /// Loan terms JSON file
        #[arg(long)]
        terms: PathBuf,
        /// Activation date (YYYY-MM-DD)
        #[arg(long)]
        activation: NaiveDate,
        /// Payment commands CSV file
        #[arg(long)]
        events: PathBuf,
        /// Path to persistent database (optional). If provided, uses RocksDB.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn read_terms(path: &Path) -> Result<LoanTerms> {
    let file = File::open(path).into_diagnostic()?;
    serde_json::from_reader(file).into_diagnostic()
}

fn open_store(db_path: Option<PathBuf>) -> Result<LedgerStoreBox> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            use repayment_engine::infrastructure::rocksdb::RocksDBStore;
            let store = RocksDBStore::open(path).into_diagnostic()?;
            Ok(Box::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(path) => {
            warn!(
                path = %path.display(),
                "Built without storage-rocksdb, falling back to in-memory storage"
            );
            Ok(Box::new(InMemoryLedgerStore::new()))
        }
        None => Ok(Box::new(InMemoryLedgerStore::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path).into_diagnostic()?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Schedule { terms, activation } => {
            let terms = read_terms(&terms)?;
            let engine = RepaymentEngine::new(Box::new(InMemoryLedgerStore::new()), config);
            let entries = engine
                .generate_schedule(LoanId::generate(), &terms, activation)
                .into_diagnostic()?;

            let stdout = io::stdout();
            let mut writer = ScheduleWriter::new(stdout.lock());
            writer.write_schedule(&entries).into_diagnostic()?;
        }
        Command::Simulate {
            terms,
            activation,
            events,
            db_path,
        } => {
            let terms = read_terms(&terms)?;
            let currency = terms.currency.clone();
            let start = activation
                .and_hms_opt(0, 0, 0)
                .map(|at| Utc.from_utc_datetime(&at))
                .unwrap_or_else(Utc::now);
            let clock = ManualClock::new(start);
            let engine = RepaymentEngine::new(open_store(db_path)?, config)
                .with_clock(Arc::new(clock.clone()));

            let book = engine.activate_loan(terms, activation).await.into_diagnostic()?;
            let simulation = Simulation::new(&engine, clock, book.loan.id, currency);
            info!(loan_id = %simulation.loan_id(), "Simulation started");

            // Process commands
            let file = File::open(events).into_diagnostic()?;
            let reader = CommandReader::new(file);
            for (row, command) in reader.commands().enumerate() {
                match command {
                    Ok(command) => match simulation.apply(row, &command).await {
                        Ok(warnings) => {
                            for warning in warnings {
                                warn!(
                                    row,
                                    payment_number = warning.payment_number,
                                    divergence = %warning.divergence,
                                    "Balance diverges from schedule"
                                );
                            }
                        }
                        Err(e) => warn!(row, error = %e, "Error applying command"),
                    },
                    Err(e) => warn!(row, error = %e, "Error reading command"),
                }
            }

            // Output final state
            let records = simulation.records().await.into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = RecordWriter::new(stdout.lock());
            writer.write_records(&records).into_diagnostic()?;
        }
    }

    Ok(())
}
