//! Append-only JSONL record logs.
//!
//! One JSON object per line. Writers only ever append; readers skip lines
//! that fail to parse so a torn write never poisons the whole file.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// File holding one report record per processed target.
pub const REPORTS_FILE: &str = "target_reports.jsonl";

/// Whether `name` can be embedded in a record file name.
pub fn is_valid_api_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// An append-only JSONL file.
pub struct RecordLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl std::fmt::Debug for RecordLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog").field("path", &self.path).finish()
    }
}

impl RecordLog {
    /// Open or create the log, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn append<T: Serialize>(&self, record: &T) -> RelayResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every parseable record in file order.
    pub fn read_all<T: DeserializeOwned>(&self) -> RelayResult<Vec<T>> {
        read_records(&self.path)
    }
}

/// Read every parseable record from a JSONL file. A missing file is empty.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> RelayResult<Vec<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping malformed line {} of {}: {e}", n + 1, path.display()),
        }
    }
    Ok(records)
}

/// One shuffled run order, recorded before any target is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleRecord {
    #[serde(rename = "apiName")]
    pub api_name: String,
    pub urls: Vec<String>,
    pub timestamp: String,
}

/// Report for a single finished target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord<R> {
    #[serde(rename = "apiName")]
    pub api_name: String,
    pub report: Vec<R>,
    pub timestamp: String,
}

/// The run-level record files under one data directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shuffle log for `api_name`. Names outside `[A-Za-z0-9_-]` are rejected.
    pub fn shuffle_path(&self, api_name: &str) -> RelayResult<PathBuf> {
        if !is_valid_api_name(api_name) {
            return Err(RelayError::InvalidInput(format!("apiName {api_name:?}")));
        }
        Ok(self.root.join(format!("shuffled_urls_{api_name}.jsonl")))
    }

    pub fn reports_path(&self) -> PathBuf {
        self.root.join(REPORTS_FILE)
    }

    /// Append the order a shuffled run will use.
    pub fn record_shuffle(&self, api_name: &str, urls: &[String]) -> RelayResult<()> {
        RecordLog::open(self.shuffle_path(api_name)?)?.append(&ShuffleRecord {
            api_name: api_name.to_string(),
            urls: urls.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Append the report row of one finished target.
    pub fn record_report<R: Serialize + Clone>(&self, api_name: &str, row: &R) -> RelayResult<()> {
        RecordLog::open(self.reports_path())?.append(&ReportRecord {
            api_name: api_name.to_string(),
            report: vec![row.clone()],
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    pub fn shuffles(&self, api_name: &str) -> RelayResult<Vec<ShuffleRecord>> {
        read_records(&self.shuffle_path(api_name)?)
    }

    pub fn reports<R: DeserializeOwned>(&self) -> RelayResult<Vec<ReportRecord<R>>> {
        read_records(&self.reports_path())
    }
}
