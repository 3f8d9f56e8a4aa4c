//! Dataset descriptors and the registry that maps level names to them.
//!
//! Every dataset level is described by one immutable [`DatasetDescriptor`]
//! loaded from configuration. The refresh engine is fully generic: key
//! columns, cadence, uniqueness, schema and width hints all come from the
//! descriptor, and nothing in the engine branches on a level's name.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::clock::RefreshCadence;
use crate::period::PeriodUnit;

/// Default pattern every entity code must match.
pub const DEFAULT_CODE_PATTERN: &str = r"^\d{6}$";

/// How often a dataset is expected to change upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// No incremental structure; every run rewrites the whole table.
    None,
    /// New rows every calendar day.
    Daily,
    /// New rows every business day.
    BusinessDay,
    /// New rows once per quarter (for example, periodic reports).
    Quarterly,
    /// New rows once per year.
    Yearly,
}

impl Cadence {
    /// Period unit used to chunk whole-market fetches when the descriptor
    /// does not name one.
    pub fn default_fetch_unit(self) -> PeriodUnit {
        match self {
            Cadence::None | Cadence::Daily => PeriodUnit::Day,
            Cadence::BusinessDay => PeriodUnit::BusinessDay,
            Cadence::Quarterly => PeriodUnit::Quarter,
            Cadence::Yearly => PeriodUnit::Year,
        }
    }

    /// Clock cadence deciding whether an individual entity is due again.
    pub fn refresh_cadence(self) -> RefreshCadence {
        match self {
            Cadence::None | Cadence::Daily => RefreshCadence::Daily,
            Cadence::BusinessDay => RefreshCadence::BusinessDay,
            Cadence::Quarterly => RefreshCadence::Quarterly,
            Cadence::Yearly => RefreshCadence::Yearly,
        }
    }
}

/// Logical type of a stored column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Calendar date without time of day.
    Date,
    /// Naive timestamp with millisecond precision.
    Timestamp,
    /// UTF-8 string.
    Utf8,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
}

impl ColumnType {
    /// Whether this type can serve as a dataset's time column.
    pub fn is_temporal(self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }
}

/// A named, typed column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Logical type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnSpec {
    /// Build a column spec.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Immutable description of one dataset level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Level identifier, also the directory name inside the store.
    pub name: String,
    /// Entity code column; `None` for market-wide series without entities.
    #[serde(default)]
    pub code_column: Option<String>,
    /// Time column every row must carry.
    pub date_column: String,
    /// Additional key columns beyond date and code.
    #[serde(default)]
    pub extra_key_columns: Vec<String>,
    /// Earliest date the source has data for.
    pub min_start: NaiveDate,
    /// Expected change frequency.
    pub cadence: Cadence,
    /// Chunking unit for whole-market fetches; defaults from the cadence.
    #[serde(default)]
    pub fetch_unit: Option<PeriodUnit>,
    /// Whether `(date, code)` must be unique among stored rows.
    #[serde(default)]
    pub unique: bool,
    /// Ordered schema.
    pub columns: Vec<ColumnSpec>,
    /// Minimum widths for string columns.
    #[serde(default)]
    pub min_widths: BTreeMap<String, usize>,
    /// Days to back-date an entity's inception when backfilling
    /// financial-report datasets.
    #[serde(default)]
    pub report_lookback_days: Option<i64>,
    /// Pattern every entity code must match.
    #[serde(default = "default_code_pattern")]
    pub code_pattern: String,
}

fn default_code_pattern() -> String {
    DEFAULT_CODE_PATTERN.to_string()
}

/// Errors raised while validating descriptors or resolving levels.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DatasetError {
    /// No descriptor is registered under this name.
    #[snafu(display("Unknown dataset level: {name}"))]
    UnknownDataset {
        /// Requested level name.
        name: String,
    },

    /// Two descriptors share a name.
    #[snafu(display("Dataset {name} is declared more than once"))]
    DuplicateDataset {
        /// Duplicated level name.
        name: String,
    },

    /// A descriptor is internally inconsistent.
    #[snafu(display("Dataset {name} is invalid: {reason}"))]
    InvalidDescriptor {
        /// Level name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The code pattern is not a valid regular expression.
    #[snafu(display("Dataset {name} has an invalid code pattern: {source}"))]
    InvalidCodePattern {
        /// Level name.
        name: String,
        /// Regex compilation error.
        source: regex::Error,
    },
}

impl DatasetDescriptor {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key columns in canonical order: date, code (if any), then extras.
    pub fn key_columns(&self) -> Vec<&str> {
        let mut keys = vec![self.date_column.as_str()];
        if let Some(code) = &self.code_column {
            keys.push(code.as_str());
        }
        keys.extend(self.extra_key_columns.iter().map(String::as_str));
        keys
    }

    /// Columns that make a row unique: `(date, code)`, or just the date for
    /// market-wide series.
    pub fn unique_columns(&self) -> Vec<&str> {
        let mut keys = vec![self.date_column.as_str()];
        if let Some(code) = &self.code_column {
            keys.push(code.as_str());
        }
        keys
    }

    /// Chunking unit for whole-market fetches.
    pub fn fetch_unit(&self) -> PeriodUnit {
        self.fetch_unit
            .unwrap_or_else(|| self.cadence.default_fetch_unit())
    }

    /// Compiled entity code pattern.
    pub fn code_regex(&self) -> Result<Regex, DatasetError> {
        Regex::new(&self.code_pattern).context(InvalidCodePatternSnafu {
            name: self.name.clone(),
        })
    }

    /// Check the descriptor for internal consistency.
    pub fn validate(&self) -> Result<(), DatasetError> {
        let invalid = |reason: String| {
            InvalidDescriptorSnafu {
                name: self.name.clone(),
                reason,
            }
            .fail()
        };

        if self.name.is_empty() || self.name.starts_with('_') || self.name.contains(['/', '\\']) {
            return invalid(format!("level name {:?} is not a usable directory name", self.name));
        }

        let mut seen = HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return invalid(format!("column {} is declared twice", col.name));
            }
        }

        match self.column(&self.date_column) {
            Some(col) if col.column_type.is_temporal() => {}
            Some(col) => {
                return invalid(format!(
                    "date column {} must be date or timestamp, found {:?}",
                    col.name, col.column_type
                ));
            }
            None => return invalid(format!("date column {} is not declared", self.date_column)),
        }

        if let Some(code) = &self.code_column {
            match self.column(code) {
                Some(col) if col.column_type == ColumnType::Utf8 => {}
                Some(col) => {
                    return invalid(format!(
                        "code column {} must be utf8, found {:?}",
                        col.name, col.column_type
                    ));
                }
                None => return invalid(format!("code column {code} is not declared")),
            }
        }

        for key in &self.extra_key_columns {
            if self.column(key).is_none() {
                return invalid(format!("key column {key} is not declared"));
            }
        }

        for name in self.min_widths.keys() {
            match self.column(name) {
                Some(col) if col.column_type == ColumnType::Utf8 => {}
                _ => return invalid(format!("width hint {name} does not name a utf8 column")),
            }
        }

        if matches!(self.report_lookback_days, Some(days) if days < 0) {
            return invalid("report_lookback_days must not be negative".to_string());
        }

        self.code_regex()?;
        Ok(())
    }
}

/// Maps level identifiers to their descriptors.
#[derive(Clone, Debug, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetDescriptor>,
}

impl DatasetRegistry {
    /// Validate and register a set of descriptors.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = DatasetDescriptor>,
    ) -> Result<Self, DatasetError> {
        let mut datasets = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let name = descriptor.name.clone();
            ensure!(
                !datasets.contains_key(&name),
                DuplicateDatasetSnafu { name: name.clone() }
            );
            datasets.insert(name, descriptor);
        }
        Ok(Self { datasets })
    }

    /// Resolve a level name.
    pub fn get(&self, name: &str) -> Result<&DatasetDescriptor, DatasetError> {
        self.datasets.get(name).context(UnknownDatasetSnafu { name })
    }

    /// Registered level names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Number of registered levels.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// True when no levels are registered.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    /// A daily quote dataset keyed by `(date, code)`.
    pub(crate) fn daily_quotes() -> DatasetDescriptor {
        DatasetDescriptor {
            name: "daily_quote".to_string(),
            code_column: Some("code".to_string()),
            date_column: "date".to_string(),
            extra_key_columns: Vec::new(),
            min_start: date(2020, 1, 1),
            cadence: Cadence::Daily,
            fetch_unit: None,
            unique: true,
            columns: vec![
                ColumnSpec::new("date", ColumnType::Date),
                ColumnSpec::new("code", ColumnType::Utf8),
                ColumnSpec::new("name", ColumnType::Utf8),
                ColumnSpec::new("close", ColumnType::Float64),
                ColumnSpec::new("volume", ColumnType::Int64),
            ],
            min_widths: BTreeMap::from([("name".to_string(), 12)]),
            report_lookback_days: None,
            code_pattern: DEFAULT_CODE_PATTERN.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn key_columns_are_date_code_then_extras() {
        let mut ds = daily_quotes();
        ds.extra_key_columns = vec!["name".to_string()];
        assert_eq!(ds.key_columns(), vec!["date", "code", "name"]);
        assert_eq!(ds.unique_columns(), vec!["date", "code"]);
    }

    #[test]
    fn fetch_unit_defaults_from_cadence() {
        let mut ds = daily_quotes();
        assert_eq!(ds.fetch_unit(), PeriodUnit::Day);
        ds.cadence = Cadence::Quarterly;
        assert_eq!(ds.fetch_unit(), PeriodUnit::Quarter);
        ds.fetch_unit = Some(PeriodUnit::Month);
        assert_eq!(ds.fetch_unit(), PeriodUnit::Month);
    }

    #[test]
    fn validate_rejects_non_temporal_date_column() {
        let mut ds = daily_quotes();
        ds.date_column = "name".to_string();
        let err = ds.validate().unwrap_err();
        assert!(matches!(err, DatasetError::InvalidDescriptor { .. }));
    }

    #[test]
    fn validate_rejects_undeclared_code_column() {
        let mut ds = daily_quotes();
        ds.code_column = Some("ticker".to_string());
        assert!(ds.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_code_pattern() {
        let mut ds = daily_quotes();
        ds.code_pattern = "([".to_string();
        assert!(matches!(
            ds.validate().unwrap_err(),
            DatasetError::InvalidCodePattern { .. }
        ));
    }

    #[test]
    fn registry_rejects_duplicates_and_resolves_names() {
        let err = DatasetRegistry::from_descriptors([daily_quotes(), daily_quotes()]).unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateDataset { .. }));

        let registry = DatasetRegistry::from_descriptors([daily_quotes()]).expect("registry");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["daily_quote"]);
        assert!(registry.get("daily_quote").is_ok());
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            DatasetError::UnknownDataset { .. }
        ));
    }
}
