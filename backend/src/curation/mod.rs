//! Curation of UK Biobank CSV exports.
//!
//! - [`header`] - header row resolution against the dictionaries
//! - [`coerce`] - raw cell to typed value
//! - [`assemble`] - one record per data row
//! - [`loader`] - batched bulk writes
//! - [`pipeline`] - the state machine tying them together

pub mod assemble;
pub mod coerce;
pub mod header;
pub mod loader;
pub mod pipeline;

pub use assemble::RecordAssembler;
pub use coerce::ValueCoercer;
pub use header::{HeaderResolver, ResolvedHeader};
pub use loader::{BatchOutcome, BulkLoader, LoaderStats, DEFAULT_BATCH_SIZE};
pub use pipeline::{
    cancellation, CancelHandle, CancelSignal, CurationPipeline, CurationReport, PipelineState,
};
