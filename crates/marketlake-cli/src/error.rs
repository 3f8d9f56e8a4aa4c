use std::path::PathBuf;

use marketlake_core::{
    config::ConfigError, guard::GuardError, predicate::PredicateError, record::RecordError,
    scheduler::SchedulerError, table::TableError,
};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Failed to load config {}: {source}", path.display()))]
    LoadConfig { path: PathBuf, source: ConfigError },

    #[snafu(display("Invalid --log-level '{spec}': {message}"))]
    InvalidLogLevel { spec: String, message: String },

    #[snafu(display("Failed to install logging: {message}"))]
    InstallLogging { message: String },

    #[snafu(display("Invalid date '{value}'. Expected YYYY-MM-DD."))]
    InvalidDate { value: String },

    #[snafu(display("Invalid --as-of '{value}'. Expected YYYY-MM-DDTHH:MM[:SS]."))]
    InvalidInstant { value: String },

    #[snafu(display("Invalid --where expression: {source}"))]
    InvalidPredicate { source: PredicateError },

    #[snafu(display("Source directory not found or not accessible: {}", path.display()))]
    SourceMissing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Operation on level {level} failed: {source}"))]
    Table {
        level: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Refresh failed: {source}"))]
    Refresh {
        #[snafu(source(from(SchedulerError, Box::new)))]
        source: Box<SchedulerError>,
    },

    #[snafu(display("Record ledger of level {level} failed: {source}"))]
    Record { level: String, source: RecordError },

    #[snafu(display("Lock operation failed: {source}"))]
    Lock { source: GuardError },

    #[snafu(display("Failed to encode output: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: std::io::Error },
}
