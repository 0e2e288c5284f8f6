//! Attendance ledger: first-seen time per recognized label.

use chrono::NaiveTime;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Time format used for every persisted timestamp.
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to write attendance file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// One row of the attendance table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRecord {
    pub label: String,
    #[serde(serialize_with = "serialize_time")]
    pub time: NaiveTime,
}

impl LedgerRecord {
    pub fn formatted_time(&self) -> String {
        self.time.format(TIME_FORMAT).to_string()
    }
}

fn serialize_time<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format(TIME_FORMAT))
}

/// Append-only record of who was seen and when they were first seen.
///
/// Holds at most one record per label. Records are never updated or removed,
/// so the stored time is always the first successful match.
#[derive(Debug, Default)]
pub struct Ledger {
    records: Vec<LedgerRecord>,
    seen: HashSet<String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless `label` is already present. Returns whether it inserted.
    pub fn record_if_new(&mut self, label: &str, time: NaiveTime) -> bool {
        if self.seen.contains(label) {
            return false;
        }
        self.seen.insert(label.to_string());
        self.records.push(LedgerRecord {
            label: label.to_string(),
            time,
        });
        true
    }

    /// All records in insertion order.
    pub fn snapshot(&self) -> Vec<LedgerRecord> {
        self.records.clone()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.seen.contains(label)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the table as CSV with a `Name,Time` header, replacing any existing file.
    pub fn write_csv(&self, path: &Path) -> Result<(), LedgerError> {
        let wrap = |source: csv::Error| LedgerError::Write {
            path: path.display().to_string(),
            source,
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .map_err(wrap)?;

        writer.write_record(["Name", "Time"]).map_err(wrap)?;
        for record in &self.records {
            writer
                .write_record([record.label.as_str(), record.formatted_time().as_str()])
                .map_err(wrap)?;
        }
        writer.flush().map_err(|e| wrap(e.into()))?;

        tracing::info!(
            path = %path.display(),
            records = self.records.len(),
            "attendance written"
        );
        Ok(())
    }
}
