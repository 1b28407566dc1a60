//! Error types for the curation pipeline.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`DictionaryError`] - field/coding dictionary loading
//! - [`HeaderError`] / [`InvalidHeaders`] - header resolution, aggregated per run
//! - [`RowError`] - fatal data-row problems
//! - [`StreamError`] - byte stream and CSV syntax failures
//! - [`SinkError`] / [`BatchError`] - bulk writes to the storage collection
//! - [`StoreError`] - job store and file access
//! - [`PipelineError`] - top-level orchestration errors
//! - [`ConfigError`] - environment configuration
//! - [`ServerError`] - HTTP layer
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

use crate::models::JobStatus;

/// Message recorded on a job when curation fails for reasons unrelated to the data.
pub const INFRASTRUCTURE_MESSAGE: &str =
    "An internal error occurred while curating the file; please try again later or contact an administrator.";

// =============================================================================
// Store Errors
// =============================================================================

/// Errors from external stores (job store, dictionary backing store, files).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No job exists with the given id.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A terminal job cannot change status.
    #[error("Job {job_id} is already {status}")]
    JobClosed { job_id: String, status: JobStatus },

    /// IO error.
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("Store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error while reading a dictionary file.
    #[error("Store CSV error: {0}")]
    Csv(#[from] csv::Error),
}

// =============================================================================
// Dictionary Errors
// =============================================================================

/// Errors while loading or using the field and coding dictionaries.
#[derive(Debug, Error)]
pub enum DictionaryError {
    /// Backing store failed.
    #[error("Failed to load dictionary: {0}")]
    Source(#[from] StoreError),

    /// A document in the backing store is unusable.
    #[error("Invalid dictionary entry for field {field_id}: {message}")]
    InvalidEntry { field_id: u32, message: String },

    /// A curation run was requested before the dictionaries were loaded.
    #[error("Dictionaries have not been loaded")]
    NotLoaded,
}

// =============================================================================
// Header Errors
// =============================================================================

/// Why a single header column could not be resolved.
///
/// Positions are zero-based CSV column indices.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// The cell is not of the form `<fieldId>-<instance>.<arrayIndex>`.
    #[error("column {position} \"{header}\" is not a valid field descriptor (expected <fieldId>-<instance>.<arrayIndex>)")]
    Malformed { position: usize, header: String },

    /// The descriptor is well formed but names no known field.
    #[error("column {position} \"{header}\" refers to field {field_id}, which does not exist in the field dictionary")]
    UnknownField {
        position: usize,
        header: String,
        field_id: u32,
    },

    /// The instance exceeds the dictionary's declared instance count.
    #[error("column {position} \"{header}\" has instance {instance} but field {field_id} allows at most {max}")]
    InstanceOutOfBounds {
        position: usize,
        header: String,
        field_id: u32,
        instance: u32,
        max: u32,
    },

    /// The array index exceeds the dictionary's declared array count.
    #[error("column {position} \"{header}\" has array index {array_index} but field {field_id} allows at most {max}")]
    ArrayOutOfBounds {
        position: usize,
        header: String,
        field_id: u32,
        array_index: u32,
        max: u32,
    },
}

impl HeaderError {
    /// Original header text of the offending column.
    pub fn header(&self) -> &str {
        match self {
            Self::Malformed { header, .. }
            | Self::UnknownField { header, .. }
            | Self::InstanceOutOfBounds { header, .. }
            | Self::ArrayOutOfBounds { header, .. } => header,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Malformed { position, .. }
            | Self::UnknownField { position, .. }
            | Self::InstanceOutOfBounds { position, .. }
            | Self::ArrayOutOfBounds { position, .. } => *position,
        }
    }
}

/// Every invalid header column of one file, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidHeaders {
    /// The file has no rows at all.
    #[error("The file is empty: no header row was found")]
    Empty,

    /// The header has no data columns after the subject identifier.
    #[error("The header row has no field columns after the subject identifier")]
    NoFieldColumns,

    /// One or more columns failed to resolve.
    #[error("The following fields are invalid therefore the job is terminated: {}", join_header_errors(.0))]
    Columns(Vec<HeaderError>),
}

fn join_header_errors(errors: &[HeaderError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// Row Errors
// =============================================================================

/// Fatal problems in a data row. Rows are 1-based with the header as row 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    /// Row width differs from the header width.
    #[error("Row {row} has {found} columns but the header has {expected}")]
    ColumnCount {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A numeric field received a value that is not a number.
    #[error("Cannot parse the supposedly numeric value \"{value}\" on row {row}, column {column} (field {header})")]
    NotNumeric {
        row: usize,
        column: usize,
        header: String,
        value: String,
    },

    /// Two columns wrote to the same field/instance/array slot.
    #[error("Duplicated value for field {header} on row {row}, column {column}")]
    DuplicateValue {
        row: usize,
        column: usize,
        header: String,
    },
}

// =============================================================================
// Stream Errors
// =============================================================================

/// Errors while turning the input byte stream into CSV rows.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The byte source terminated abnormally.
    #[error("Input stream aborted: {0}")]
    Aborted(#[source] std::io::Error),

    /// Malformed CSV.
    #[error("Invalid CSV near row {row}: {message}")]
    Csv { row: usize, message: String },

    /// A cell is not valid UTF-8.
    #[error("Row {row} is not valid UTF-8")]
    Encoding { row: usize },
}

// =============================================================================
// Sink Errors
// =============================================================================

/// Errors reported by a [`crate::store::RecordSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// Nothing from the batch was written.
    #[error("Bulk insert failed: {0}")]
    Unavailable(String),

    /// Some documents were written, others were rejected (indices into the batch).
    #[error("Bulk insert partially failed: {inserted} inserted, {} rejected", .failures.len())]
    Partial {
        inserted: usize,
        failures: Vec<(usize, String)>,
    },

    /// IO error.
    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("Sink JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A failed batch flush, with the affected subjects when known.
#[derive(Debug, Error)]
#[error("Batch {batch} of {size} records failed: {source}")]
pub struct BatchError {
    pub batch: usize,
    pub size: usize,
    /// Subject ids of the records the sink rejected.
    pub failed_subjects: Vec<String>,
    #[source]
    pub source: SinkError,
}

// =============================================================================
// Pipeline Errors (top-level)
// =============================================================================

/// Top-level pipeline orchestration errors.
///
/// This is the error type recorded by [`crate::curation::CurationPipeline`].
/// It wraps all lower-level errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Header resolution failed.
    #[error("{0}")]
    Header(#[from] InvalidHeaders),

    /// A data row failed.
    #[error("{0}")]
    Row(#[from] RowError),

    /// Reading or splitting the input failed.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Dictionary error.
    #[error("Dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    /// Bulk write error.
    #[error("Storage error: {0}")]
    Batch(#[from] BatchError),

    /// Job store error.
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// The run exceeded its wall-clock ceiling.
    #[error("Curation timed out after {0} seconds")]
    TimedOut(u64),

    /// The run was stopped before it finished.
    #[error("Curation cancelled: {0}")]
    Cancelled(&'static str),
}

impl PipelineError {
    /// Whether the failure comes from infrastructure rather than the data.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Header(_) | Self::Row(_) | Self::Cancelled(_) => false,
            Self::Stream(StreamError::Csv { .. } | StreamError::Encoding { .. }) => false,
            Self::Stream(StreamError::Aborted(_)) => true,
            Self::Dictionary(_) | Self::Batch(_) | Self::Store(_) | Self::TimedOut(_) => true,
        }
    }

    /// Text written to the job's `error` field.
    pub fn job_message(&self) -> String {
        if self.is_infrastructure() {
            INFRASTRUCTURE_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

// =============================================================================
// Config Errors
// =============================================================================

/// Invalid configuration value.
#[derive(Debug, Error)]
#[error("Invalid value {value:?} for {key}: {message}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub message: String,
}

// =============================================================================
// Server Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Pipeline error.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service cannot accept work yet.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Server internal error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for dictionary operations.
pub type DictionaryResult<T> = Result<T, DictionaryError>;

/// Result type for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_chain() {
        // RowError -> PipelineError
        let row_err = RowError::ColumnCount { row: 4, expected: 3, found: 2 };
        let pipeline_err: PipelineError = row_err.into();
        assert!(pipeline_err.to_string().contains("Row 4"));
        assert!(!pipeline_err.is_infrastructure());

        // StoreError -> DictionaryError -> PipelineError
        let dict_err: DictionaryError = StoreError::Unavailable("mongo down".into()).into();
        let pipeline_err: PipelineError = dict_err.into();
        assert!(pipeline_err.is_infrastructure());
        assert_eq!(pipeline_err.job_message(), INFRASTRUCTURE_MESSAGE);
    }

    #[test]
    fn test_invalid_headers_lists_every_column() {
        let err = InvalidHeaders::Columns(vec![
            HeaderError::Malformed { position: 1, header: "abc".into() },
            HeaderError::UnknownField { position: 2, header: "99-0.0".into(), field_id: 99 },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("\"abc\" is not a valid field descriptor"));
        assert!(msg.contains("\"99-0.0\" refers to field 99, which does not exist"));
    }

    #[test]
    fn test_not_numeric_message_format() {
        let err = RowError::NotNumeric {
            row: 2,
            column: 1,
            header: "40-1.0".into(),
            value: "abc".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"abc\""));
        assert!(msg.contains("40-1.0"));
        assert!(msg.contains("row 2"));
    }

    #[test]
    fn test_data_errors_keep_their_message() {
        let err: PipelineError = StreamError::Csv { row: 3, message: "unequal".into() }.into();
        assert!(!err.is_infrastructure());
        assert!(err.job_message().contains("row 3"));
    }
}
