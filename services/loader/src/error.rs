//! Error types for the loader
//!
//! Row-level validation failures are not errors: they come back from the
//! validator as [`crate::validate::Rejection`] values and the run continues.
//! Everything here except `Report` is fatal to the run it occurs in.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    /// Bad or missing settings, unreachable sink. Raised before a run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The record source could not be read
    #[error("extract error: {0}")]
    Extract(String),

    /// A read against the sink failed
    #[error("sink read error: {0}")]
    SinkRead(String),

    /// A write against the sink failed
    #[error("sink write error: {0}")]
    SinkWrite(String),

    /// The rejection report could not be written. Logged, never fatal.
    #[error("report error: {0}")]
    Report(String),
}

impl LoaderError {
    /// Wrap a database failure that happened while reading
    pub fn read(err: impl std::fmt::Display) -> Self {
        LoaderError::SinkRead(err.to_string())
    }

    /// Wrap a database failure that happened while writing
    pub fn write(err: impl std::fmt::Display) -> Self {
        LoaderError::SinkWrite(err.to_string())
    }

    /// Short machine-friendly label, used in the run journal
    pub fn kind(&self) -> &'static str {
        match self {
            LoaderError::Configuration(_) => "configuration",
            LoaderError::Extract(_) => "extract",
            LoaderError::SinkRead(_) => "sink_read",
            LoaderError::SinkWrite(_) => "sink_write",
            LoaderError::Report(_) => "report",
        }
    }
}

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;
