//! Rejection reporting
//!
//! Every rejected row is handed to a [`RejectionSink`] once. The default sink
//! logs; `--rejections <path>` adds a CSV file.

use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::error::{LoaderError, Result};
use crate::validate::Rejection;

pub trait RejectionSink: Send {
    fn report(&mut self, rejection: &Rejection) -> Result<()>;

    /// Flush anything buffered. Called once after validation.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hand every rejection to `sink`, then flush it. Report failures are
/// logged and skipped; the count of failed calls is returned.
pub fn report_all(sink: &mut dyn RejectionSink, rejections: &[Rejection]) -> usize {
    let mut failures = 0;
    for rejection in rejections {
        if let Err(e) = sink.report(rejection) {
            warn!("{}", e);
            failures += 1;
        }
    }
    if let Err(e) = sink.finish() {
        warn!("{}", e);
        failures += 1;
    }
    failures
}

/// Logs each rejection at `warn`
#[derive(Debug, Default)]
pub struct LogRejections;

impl RejectionSink for LogRejections {
    fn report(&mut self, rejection: &Rejection) -> Result<()> {
        warn!(
            line = rejection.line,
            transaction_id = rejection.transaction_id.as_deref().unwrap_or("-"),
            kind = %rejection.kind,
            field = rejection.field,
            "Rejected row: {}",
            rejection.detail
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RejectionRow<'a> {
    line: usize,
    transaction_id: &'a str,
    kind: &'static str,
    field: &'static str,
    detail: &'a str,
}

/// Writes one CSV row per rejection, and logs it too
pub struct CsvRejections<W: Write + Send> {
    writer: csv::Writer<W>,
    log: LogRejections,
}

impl CsvRejections<File> {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(path).map_err(|e| {
            LoaderError::Configuration(format!(
                "cannot create rejection report {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_writer(writer))
    }
}

impl<W: Write + Send> CsvRejections<W> {
    pub fn new(inner: W) -> Self {
        Self::from_writer(csv::Writer::from_writer(inner))
    }

    fn from_writer(writer: csv::Writer<W>) -> Self {
        Self {
            writer,
            log: LogRejections,
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| LoaderError::Report(format!("rejection report flush failed: {}", e)))
    }
}

impl<W: Write + Send> RejectionSink for CsvRejections<W> {
    fn report(&mut self, rejection: &Rejection) -> Result<()> {
        self.log.report(rejection)?;
        self.writer
            .serialize(RejectionRow {
                line: rejection.line,
                transaction_id: rejection.transaction_id.as_deref().unwrap_or(""),
                kind: rejection.kind.as_str(),
                field: rejection.field,
                detail: &rejection.detail,
            })
            .map_err(|e| LoaderError::Report(format!("rejection report write failed: {}", e)))
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| LoaderError::Report(format!("rejection report flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::RejectionKind;

    struct Refusing;

    impl RejectionSink for Refusing {
        fn report(&mut self, _rejection: &Rejection) -> Result<()> {
            Err(LoaderError::Report("disk full".into()))
        }

        fn finish(&mut self) -> Result<()> {
            Err(LoaderError::Report("disk full".into()))
        }
    }

    fn rejection(line: usize) -> Rejection {
        Rejection {
            line,
            transaction_id: None,
            kind: RejectionKind::MalformedDate,
            field: "date",
            detail: "not a date".into(),
        }
    }

    #[test]
    fn test_report_all_survives_failures() {
        let failures = report_all(&mut Refusing, &[rejection(2), rejection(3)]);
        assert_eq!(failures, 3);
    }

    #[test]
    fn test_report_all_writes_every_row() {
        let mut sink = CsvRejections::new(Vec::new());
        assert_eq!(report_all(&mut sink, &[rejection(2), rejection(3)]), 0);
        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn test_csv_report_rows() {
        let mut sink = CsvRejections::new(Vec::new());
        sink.report(&Rejection {
            line: 4,
            transaction_id: Some("1004".into()),
            kind: RejectionKind::NonPositiveQuantity,
            field: "quantity",
            detail: "quantity must be positive, found 0".into(),
        })
        .unwrap();
        sink.report(&Rejection {
            line: 5,
            transaction_id: None,
            kind: RejectionKind::MissingField,
            field: "transaction_id",
            detail: "'transaction_id' is missing or blank".into(),
        })
        .unwrap();
        sink.finish().unwrap();

        let out = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "line,transaction_id,kind,field,detail");
        assert_eq!(lines[1], "4,1004,NonPositiveQuantity,quantity,\"quantity must be positive, found 0\"");
        assert!(lines[2].starts_with("5,,MissingField,transaction_id,"));
    }
}
