//! Record sources - read a file into untyped rows
//!
//! Supported formats:
//! - `.csv`: header row required; cells trimmed; UTF-8 BOM stripped
//! - `.xlsx` / `.xls` / `.xlsb` / `.ods`: first sheet, first row is the header
//!
//! Sources do no validation. A CSV row the reader cannot split still
//! produces a (blank) record so it shows up as a rejection rather than
//! vanishing.

use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{LoaderError, Result};
use crate::model::{RawRecord, RawValue};

#[async_trait]
pub trait RecordSource: Send {
    /// Human-readable origin, used in logs and the run journal
    fn label(&self) -> String;

    async fn read_records(&mut self) -> Result<Vec<RawRecord>>;
}

/// Pick a source by file extension
pub fn open_source(path: &Path) -> Result<Box<dyn RecordSource>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => Ok(Box::new(CsvSource::new(path))),
        "xlsx" | "xls" | "xlsb" | "ods" => Ok(Box::new(SpreadsheetSource::new(path))),
        _ => Err(LoaderError::Extract(format!(
            "unsupported file format: {}",
            path.display()
        ))),
    }
}

// =============================================================================
// CSV
// =============================================================================

pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for CsvSource {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            LoaderError::Extract(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let records = parse_csv(&content)?;
        info!("Extracted {} records from {}", records.len(), self.path.display());
        Ok(records)
    }
}

/// Parse CSV text into raw records. Header names are lowercased.
pub fn parse_csv(content: &str) -> Result<Vec<RawRecord>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LoaderError::Extract(format!("failed to read CSV headers: {}", e)))?
        .iter()
        .map(|h| h.to_lowercase())
        .collect();

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let fallback_line = idx + 2; // 1-indexed + header
        match result {
            Ok(row) => {
                let line = row
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(fallback_line);
                let mut record = RawRecord::new(line);
                for (name, cell) in headers.iter().zip(row.iter()) {
                    record.set(name, RawValue::from(cell));
                }
                records.push(record);
            }
            Err(e) => {
                warn!("Line {}: unreadable CSV row: {}", fallback_line, e);
                records.push(RawRecord::new(fallback_line));
            }
        }
    }
    Ok(records)
}

// =============================================================================
// Spreadsheets
// =============================================================================

pub struct SpreadsheetSource {
    path: PathBuf,
}

impl SpreadsheetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for SpreadsheetSource {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_first_sheet(&path))
            .await
            .map_err(|e| LoaderError::Extract(format!("spreadsheet reader panicked: {}", e)))??;
        info!("Extracted {} records from {}", records.len(), self.path.display());
        Ok(records)
    }
}

fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Empty => RawValue::Empty,
        Data::String(s) => RawValue::from(s.as_str()),
        Data::Int(i) => RawValue::Int(*i),
        Data::Float(f) => RawValue::Float(*f),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) => RawValue::Date(ts.date()),
            None => RawValue::Float(dt.as_f64()),
        },
        other => RawValue::Text(other.to_string()),
    }
}

fn read_first_sheet(path: &Path) -> Result<Vec<RawRecord>> {
    let extract = |msg: String| LoaderError::Extract(msg);

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| extract(format!("failed to open {}: {}", path.display(), e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| extract(format!("{} has no sheets", path.display())))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| extract(format!("failed to read sheet '{}': {}", sheet_name, e)))?;

    let mut rows = range.rows();
    let headers: Vec<String> = match rows.next() {
        Some(row) => row
            .iter()
            .map(|cell| match cell {
                Data::String(s) => s.trim().to_lowercase(),
                Data::Empty => String::new(),
                other => other.to_string().to_lowercase(),
            })
            .collect(),
        None => return Ok(Vec::new()),
    };

    let records = rows
        .enumerate()
        .map(|(idx, row)| {
            let mut record = RawRecord::new(idx + 2);
            for (name, cell) in headers.iter().zip(row.iter()) {
                if !name.is_empty() {
                    record.set(name, cell_value(cell));
                }
            }
            record
        })
        .collect();
    Ok(records)
}

// =============================================================================
// In-memory
// =============================================================================

/// Records already in memory; used by callers embedding the engine and by tests
pub struct VecSource {
    label: String,
    records: Vec<RawRecord>,
}

impl VecSource {
    pub fn new(label: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            label: label.into(),
            records,
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn read_records(&mut self) -> Result<Vec<RawRecord>> {
        Ok(self.records.clone())
    }
}
