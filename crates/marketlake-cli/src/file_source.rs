//! Offline `WebSource` reading files dropped into a directory.
//!
//! ```text
//! <root>/<level>/entities.json   [{"code": "000001", "inception": "2020-01-01"}, ...]
//! <root>/<level>/rows.jsonl      one JSON object per line
//! ```
//!
//! Missing files read as empty. Rows are served when their date column
//! falls inside the requested window and, for per-entity requests, their
//! code matches.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use marketlake_core::{
    dataset::DatasetDescriptor,
    row::{RawRow, parse_date},
    source::{Entity, FetchError, FetchRequest, WebSource},
};
use tracing::debug;

const ENTITIES_FILE: &str = "entities.json";
const ROWS_FILE: &str = "rows.jsonl";

pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_optional(&self, level: &str, file: &str) -> Result<Option<String>, FetchError> {
        let path = self.root.join(level).join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FetchError::Transient {
                message: format!("reading {}: {e}", path.display()),
            }),
        }
    }
}

#[async_trait]
impl WebSource for DirectorySource {
    async fn entities(&self, dataset: &DatasetDescriptor) -> Result<Vec<Entity>, FetchError> {
        let Some(text) = self.read_optional(&dataset.name, ENTITIES_FILE).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&text).map_err(|e| FetchError::Rejected {
            message: format!("{}/{ENTITIES_FILE}: {e}", dataset.name),
        })
    }

    async fn fetch(
        &self,
        dataset: &DatasetDescriptor,
        request: &FetchRequest,
    ) -> Result<Vec<RawRow>, FetchError> {
        let Some(text) = self.read_optional(&dataset.name, ROWS_FILE).await? else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: RawRow = serde_json::from_str(line).map_err(|e| FetchError::Rejected {
                message: format!("{}/{ROWS_FILE} line {}: {e}", dataset.name, n + 1),
            })?;
            if matches_request(&row, dataset, request) {
                rows.push(row);
            }
        }

        debug!(
            level = %dataset.name,
            start = %request.window.start,
            end = %request.window.end,
            rows = rows.len(),
            "served rows from directory"
        );
        Ok(rows)
    }
}

fn matches_request(row: &RawRow, dataset: &DatasetDescriptor, request: &FetchRequest) -> bool {
    let in_window = row
        .get(&dataset.date_column)
        .and_then(|v| v.as_str())
        .and_then(parse_date)
        .is_some_and(|day| request.window.contains(day));

    let right_entity = match (&request.entity, &dataset.code_column) {
        (Some(code), Some(column)) => {
            row.get(column).and_then(|v| v.as_str()) == Some(code.as_str())
        }
        _ => true,
    };

    in_window && right_entity
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            "not a directory",
        ))
    }
}
