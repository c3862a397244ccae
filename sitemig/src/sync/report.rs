use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Error,
    Skipped,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub path: String,
    pub status: TransferStatus,
    pub size: Option<u64>,
    pub message: String,
}

impl TransferRecord {
    pub fn new(
        path: impl Into<String>,
        status: TransferStatus,
        size: Option<u64>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            status,
            size,
            message: message.into(),
        }
    }

    pub fn success(path: impl Into<String>, size: Option<u64>, message: impl Into<String>) -> Self {
        Self::new(path, TransferStatus::Success, size, message)
    }

    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(path, TransferStatus::Error, None, message)
    }

    pub fn skipped(path: impl Into<String>, size: Option<u64>, message: impl Into<String>) -> Self {
        Self::new(path, TransferStatus::Skipped, size, message)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub deleted: usize,
}

impl ReportSummary {
    pub fn from_records(records: &[TransferRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.status {
                TransferStatus::Success => summary.success += 1,
                TransferStatus::Error => summary.error += 1,
                TransferStatus::Skipped => summary.skipped += 1,
                TransferStatus::Deleted => summary.deleted += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.success + self.error + self.skipped + self.deleted
    }
}

/// Collects per-item outcomes from concurrently running workers, in
/// completion order.
#[derive(Debug, Default)]
pub struct TransferReporter {
    records: Mutex<Vec<TransferRecord>>,
}

impl TransferReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: TransferRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> ReportSummary {
        self.records
            .lock()
            .map(|records| ReportSummary::from_records(&records))
            .unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<TransferRecord> {
        match self.records.lock() {
            Ok(mut records) => std::mem::take(&mut *records),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

/// Picks the report file: `<name>.csv`, or the next free `<name>-N.csv` when
/// earlier reports must be kept apart.
pub fn report_path(dir: &Path, name: &str, concatenate: bool) -> Result<PathBuf, ReportError> {
    if concatenate || !dir.exists() {
        return Ok(dir.join(format!("{name}.csv")));
    }
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let file_name = entry?.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.ends_with(".csv")
            && (file_name.starts_with(&format!("{name}."))
                || file_name.starts_with(&format!("{name}-")))
        {
            count += 1;
        }
    }
    let stem = if count > 0 {
        format!("{name}-{}", count + 1)
    } else {
        name.to_string()
    };
    Ok(dir.join(format!("{stem}.csv")))
}

pub fn save_report(
    records: &[TransferRecord],
    dir: &Path,
    name: &str,
    concatenate: bool,
) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(dir)?;
    let path = report_path(dir, name, concatenate)?;
    let has_rows = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!has_rows)
        .from_writer(file);
    if records.is_empty() && !has_rows {
        writer.write_record(["path", "status", "size", "message"])?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(path)
}

/// `42s`, `3m 5s` or `2h 14m`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}
