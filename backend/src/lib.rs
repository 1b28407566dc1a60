//! # UKB Curator - streaming curation of UK Biobank CSV exports
//!
//! Validates every header column of a phenotype export against a field
//! dictionary, decodes categorical cells through coding tables, coerces
//! numeric cells and bulk-writes one structured record per participant.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Byte chunks │────▶│  RowStream  │────▶│   Header    │────▶│ Coerce and  │────▶│ BulkLoader  │
//! │ (file/HTTP) │     │  (parser)   │     │  Resolver   │     │  Assemble   │     │   (sink)    │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use curator::{cancellation, file_chunks, CurationJob, CurationOptions, CurationPipeline};
//! use curator::{Dictionaries, FileDictionarySource, JobStore, MemoryJobStore, NdjsonSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dictionaries = Arc::new(Dictionaries::new());
//!     dictionaries
//!         .load(&FileDictionarySource::new("Data_Dictionary_Showcase.csv", "Codings.csv"))
//!         .await?;
//!
//!     let jobs = Arc::new(MemoryJobStore::new());
//!     let job = CurationJob::new("UKBIOBANK", vec!["ukb.csv".into()]);
//!     let job_id = job.id.clone();
//!     jobs.insert(job).await?;
//!
//!     let sink = Arc::new(NdjsonSink::create("records.ndjson").await?);
//!     let mut pipeline = CurationPipeline::new(job_id, dictionaries, sink, jobs, CurationOptions::default());
//!     let file = tokio::fs::File::open("ukb.csv").await?;
//!     let (_handle, signal) = cancellation();
//!     let report = pipeline.run(file_chunks(file, 64 * 1024), signal).await;
//!     println!("{:?}: {} records", report.state, report.records_written);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types
//! - [`models`] - Domain models (descriptors, dictionary documents, records, jobs)
//! - [`config`] - Run options and environment configuration
//! - [`dictionary`] - Field and coding dictionaries
//! - [`parser`] - Streaming CSV row splitter
//! - [`curation`] - Header resolution, coercion, assembly, loading and the pipeline
//! - [`store`] - Sink, job store and dictionary source traits with implementations
//! - [`api`] - HTTP API server

// Core modules
pub mod config;
pub mod error;
pub mod models;

// Dictionaries
pub mod dictionary;

// Parsing
pub mod parser;

// Curation
pub mod curation;

// Storage
pub mod store;

// HTTP API
pub mod api;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    BatchError, ConfigError, DictionaryError, HeaderError, InvalidHeaders, PipelineError,
    PipelineResult, RowError, ServerError, SinkError, StoreError, StreamError,
    INFRASTRUCTURE_MESSAGE,
};

// =============================================================================
// Re-exports - Models
// =============================================================================

pub use models::{
    CodingEntry, CodingTable, ColumnSpec, CuratedValue, CurationJob, CurationRecord,
    FieldDescriptor, FieldDictionaryEntry, JobStatus, RecordLayout, ResolvedColumn, Slot,
    ValueType, DEFAULT_STUDY_ID,
};

// =============================================================================
// Re-exports - Configuration
// =============================================================================

pub use config::{CurationOptions, CuratorConfig};

// =============================================================================
// Re-exports - Dictionaries
// =============================================================================

pub use dictionary::{CodingDictionary, Dictionaries, DictionarySnapshot, FieldDictionary};

// =============================================================================
// Re-exports - Parsing
// =============================================================================

pub use parser::{bytes_chunks, file_chunks, Row, RowStream, DEFAULT_CHUNK_SIZE};

// =============================================================================
// Re-exports - Curation
// =============================================================================

pub use curation::{
    cancellation, BatchOutcome, BulkLoader, CancelHandle, CancelSignal, CurationPipeline,
    CurationReport, HeaderResolver, LoaderStats, PipelineState, RecordAssembler,
    ResolvedHeader, ValueCoercer,
};

// =============================================================================
// Re-exports - Storage
// =============================================================================

pub use store::{
    DictionarySource, FileDictionarySource, JobStore, MemoryDictionarySource, MemoryJobStore,
    MemorySink, NdjsonSink, RecordSink,
};

// Server
pub mod server {
    pub use crate::api::server::start_server;
}
