//! Engine settings and dataset descriptors loaded from TOML.
//!
//! ```toml
//! [engine]
//! anchor_hour = 9
//! workers = 4
//! backfill_passes = 3
//!
//! [engine.retry]
//! max_attempts = 3
//! base_delay_ms = 500
//!
//! [[datasets]]
//! name = "daily_quote"
//! code_column = "code"
//! date_column = "date"
//! min_start = "2010-03-31"
//! cadence = "business_day"
//! unique = true
//! columns = [
//!   { name = "date", type = "date" },
//!   { name = "code", type = "utf8" },
//!   { name = "close", type = "float64" },
//! ]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    clock::{Anchor, BoundaryEdge, DEFAULT_ANCHOR_HOUR},
    dataset::{DatasetDescriptor, DatasetError, DatasetRegistry},
    retry::{RetryConfigError, RetryPolicy},
};

/// Errors while loading configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The file could not be read.
    #[snafu(display("Failed to read config {}: {source}", path.display()))]
    Read {
        /// Config path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML of the expected shape.
    #[snafu(display("Failed to parse config: {source}"))]
    Parse {
        /// TOML error.
        source: toml::de::Error,
    },

    /// A dataset descriptor is invalid.
    #[snafu(display("Invalid dataset configuration: {source}"))]
    Datasets {
        /// Registry error.
        source: DatasetError,
    },

    /// An engine setting is out of range.
    #[snafu(display("Invalid engine setting {setting}: {reason}"))]
    Engine {
        /// Setting name.
        setting: String,
        /// What is wrong.
        reason: String,
    },

    /// The `[engine.retry]` table is inconsistent.
    #[snafu(display("Invalid engine setting retry: {source}"))]
    Retry {
        /// Retry settings error.
        source: RetryConfigError,
    },
}

fn default_anchor_hour() -> u32 {
    DEFAULT_ANCHOR_HOUR
}

fn default_workers() -> usize {
    4
}

fn default_backfill_passes() -> u32 {
    3
}

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hour of day at which daily refreshes become eligible.
    #[serde(default = "default_anchor_hour")]
    pub anchor_hour: u32,
    /// Period edge coarse refresh cadences land on.
    #[serde(default)]
    pub anchor_edge: BoundaryEdge,
    /// Concurrent per-entity backfill fetches.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Passes over failed backfill entities before giving up.
    #[serde(default = "default_backfill_passes")]
    pub backfill_passes: u32,
    /// Retry policy around every source call.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            anchor_hour: DEFAULT_ANCHOR_HOUR,
            anchor_edge: BoundaryEdge::Start,
            workers: default_workers(),
            backfill_passes: default_backfill_passes(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Clock anchor derived from the settings.
    pub fn anchor(&self) -> Anchor {
        Anchor {
            hour: self.anchor_hour,
            edge: self.anchor_edge,
        }
    }

    /// Check every setting is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.anchor_hour <= 23,
            EngineSnafu {
                setting: "anchor_hour",
                reason: format!("{} is not an hour of day", self.anchor_hour),
            }
        );
        ensure!(
            self.workers >= 1,
            EngineSnafu {
                setting: "workers",
                reason: "must be at least 1",
            }
        );
        ensure!(
            self.backfill_passes >= 1,
            EngineSnafu {
                setting: "backfill_passes",
                reason: "must be at least 1",
            }
        );
        self.retry.validate().context(RetrySnafu)
    }
}

/// Whole configuration file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Dataset descriptors.
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
}

impl StoreConfig {
    /// Parse configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).context(ParseSnafu)
    }

    /// Read and parse a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::from_toml_str(&text)
    }

    /// Validate and split into engine settings and the dataset registry.
    pub fn into_parts(self) -> Result<(EngineConfig, DatasetRegistry), ConfigError> {
        self.engine.validate()?;
        let registry = DatasetRegistry::from_descriptors(self.datasets).context(DatasetsSnafu)?;
        Ok((self.engine, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Cadence, ColumnType};
    use crate::dataset::test_util::date;
    use crate::period::PeriodUnit;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const SAMPLE: &str = r#"
[engine]
anchor_hour = 8
workers = 2

[engine.retry]
max_attempts = 5
jitter_ms = 0

[[datasets]]
name = "daily_quote"
code_column = "code"
date_column = "date"
min_start = "2010-03-31"
cadence = "business_day"
unique = true
min_widths = { name = 16 }
columns = [
  { name = "date", type = "date" },
  { name = "code", type = "utf8" },
  { name = "name", type = "utf8" },
  { name = "close", type = "float64" },
]

[[datasets]]
name = "report"
code_column = "code"
date_column = "report_date"
min_start = "2005-01-01"
cadence = "quarterly"
fetch_unit = "quarter"
report_lookback_days = 1825
columns = [
  { name = "report_date", type = "date" },
  { name = "code", type = "utf8" },
  { name = "eps", type = "float64" },
]
"#;

    #[test]
    fn parses_engine_and_datasets() -> TestResult {
        let (engine, registry) = StoreConfig::from_toml_str(SAMPLE)?.into_parts()?;

        assert_eq!(engine.anchor_hour, 8);
        assert_eq!(engine.workers, 2);
        assert_eq!(engine.backfill_passes, 3);
        assert_eq!(engine.retry.max_attempts, 5);
        assert_eq!(engine.retry.base_delay_ms, 500);
        assert_eq!(engine.retry.jitter_ms, 0);

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["daily_quote", "report"]);
        let quotes = registry.get("daily_quote")?;
        assert_eq!(quotes.cadence, Cadence::BusinessDay);
        assert_eq!(quotes.min_start, date(2010, 3, 31));
        assert_eq!(quotes.min_widths.get("name"), Some(&16));
        assert_eq!(quotes.columns[3].column_type, ColumnType::Float64);

        let report = registry.get("report")?;
        assert_eq!(report.fetch_unit(), PeriodUnit::Quarter);
        assert_eq!(report.report_lookback_days, Some(1825));
        assert!(!report.unique);
        Ok(())
    }

    #[test]
    fn empty_config_uses_defaults() -> TestResult {
        let (engine, registry) = StoreConfig::from_toml_str("")?.into_parts()?;
        assert_eq!(engine, EngineConfig::default());
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_settings() {
        let err = StoreConfig::from_toml_str("[engine]\nanchor_hour = 24\n")
            .and_then(StoreConfig::into_parts)
            .expect_err("bad hour");
        assert!(matches!(err, ConfigError::Engine { .. }));

        let err = StoreConfig::from_toml_str("[engine]\nworkers = 0\n")
            .and_then(StoreConfig::into_parts)
            .expect_err("no workers");
        assert!(matches!(err, ConfigError::Engine { .. }));

        let err = StoreConfig::from_toml_str("[engine.retry]\nmax_attempts = 0\n")
            .and_then(StoreConfig::into_parts)
            .expect_err("no attempts");
        assert!(matches!(
            err,
            ConfigError::Retry {
                source: RetryConfigError::NoAttempts
            }
        ));
    }

    #[test]
    fn rejects_invalid_descriptors() {
        let text = r#"
[[datasets]]
name = "bad"
date_column = "date"
min_start = "2020-01-01"
cadence = "daily"
columns = [{ name = "date", type = "utf8" }]
"#;
        let err = StoreConfig::from_toml_str(text)
            .and_then(StoreConfig::into_parts)
            .expect_err("bad descriptor");
        assert!(matches!(err, ConfigError::Datasets { .. }));
    }

    #[tokio::test]
    async fn load_reports_missing_files() {
        let err = StoreConfig::load("/definitely/not/here.toml")
            .await
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
