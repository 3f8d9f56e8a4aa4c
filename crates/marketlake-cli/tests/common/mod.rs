#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use chrono::NaiveDate;
use tempfile::TempDir;

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const LEVEL: &str = "daily_quote";

const CONFIG: &str = r#"
[engine]
anchor_hour = 9
workers = 2
backfill_passes = 2

[engine.retry]
max_attempts = 1
base_delay_ms = 0
max_delay_ms = 0
jitter_ms = 0

[[datasets]]
name = "daily_quote"
code_column = "code"
date_column = "date"
min_start = "2020-01-01"
cadence = "daily"
fetch_unit = "month"
unique = true
min_widths = { name = 8 }
columns = [
  { name = "date", type = "date" },
  { name = "code", type = "utf8" },
  { name = "name", type = "utf8" },
  { name = "close", type = "float64" },
]
"#;

/// A config file, an empty store and a file-drop source in one temp dir.
pub struct Workspace {
    _tmp: TempDir,
    pub config: PathBuf,
    pub store: PathBuf,
    pub source: PathBuf,
    entities: Vec<(String, NaiveDate)>,
    rows: String,
}

impl Workspace {
    pub fn new() -> TestResult<Self> {
        let tmp = TempDir::new()?;
        let config = tmp.path().join("marketlake.toml");
        std::fs::write(&config, CONFIG)?;
        let store = tmp.path().join("store");
        let source = tmp.path().join("source");
        std::fs::create_dir_all(source.join(LEVEL))?;
        std::fs::create_dir_all(&store)?;
        Ok(Self {
            _tmp: tmp,
            config,
            store,
            source,
            entities: Vec::new(),
            rows: String::new(),
        })
    }

    /// List `code` with one quote per day over `[inception, last]`.
    pub fn add_entity(
        &mut self,
        code: &str,
        inception: NaiveDate,
        last: NaiveDate,
        close: f64,
    ) -> TestResult {
        self.entities.push((code.to_string(), inception));
        let mut day = inception;
        while day <= last {
            writeln!(
                self.rows,
                r#"{{"date": "{}", "code": "{code}", "name": "n{code}", "close": {close}}}"#,
                day.format("%Y-%m-%d")
            )?;
            day = day.succ_opt().ok_or("date overflow")?;
        }
        self.flush()
    }

    fn flush(&self) -> TestResult {
        let entities: Vec<serde_json::Value> = self
            .entities
            .iter()
            .map(|(code, inception)| {
                serde_json::json!({
                    "code": code,
                    "inception": inception.format("%Y-%m-%d").to_string(),
                })
            })
            .collect();
        let dir = self.source.join(LEVEL);
        std::fs::write(dir.join("entities.json"), serde_json::to_string(&entities)?)?;
        std::fs::write(dir.join("rows.jsonl"), &self.rows)?;
        Ok(())
    }

    /// `mlake --config .. --store ..` ready for subcommand arguments.
    pub fn cli(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mlake"));
        cmd.arg("--config")
            .arg(&self.config)
            .arg("--store")
            .arg(&self.store)
            .args(["--log-level", "warn"]);
        cmd
    }

    /// Run `refresh` against the source as of `as_of`.
    pub fn refresh(&self, as_of: &str) -> Command {
        let mut cmd = self.cli();
        cmd.arg("refresh")
            .arg("--source")
            .arg(&self.source)
            .args(["--as-of", as_of]);
        cmd
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store.join("_locks").join(format!("{LEVEL}.lock"))
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn stdout_lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}
