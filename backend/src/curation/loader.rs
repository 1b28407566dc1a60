//! Batched bulk writes of curated records.

use std::sync::Arc;

use crate::error::{BatchError, SinkError};
use crate::models::CurationRecord;
use crate::store::RecordSink;

/// Batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Running totals of a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Batches written successfully.
    pub batches: usize,
    /// Records written, including the accepted part of a partially failed batch.
    pub records: usize,
}

/// Result of one successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 1-based batch number, 0 when there was nothing to flush.
    pub batch: usize,
    pub size: usize,
    pub inserted: usize,
}

/// Buffers records and writes them to a [`RecordSink`] in fixed-size batches.
///
/// `add` awaits the flush it triggers, so at most one write is in flight.
pub struct BulkLoader {
    sink: Arc<dyn RecordSink>,
    batch_size: usize,
    buffer: Vec<CurationRecord>,
    stats: LoaderStats,
}

impl BulkLoader {
    pub fn new(sink: Arc<dyn RecordSink>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            stats: LoaderStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Buffer a record, flushing when the batch is full.
    pub async fn add(&mut self, record: CurationRecord) -> Result<Option<BatchOutcome>, BatchError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Write the buffered records as one bulk insert and clear the buffer.
    ///
    /// The buffer is cleared whether or not the write succeeds.
    pub async fn flush(&mut self) -> Result<BatchOutcome, BatchError> {
        if self.buffer.is_empty() {
            return Ok(BatchOutcome {
                batch: 0,
                size: 0,
                inserted: 0,
            });
        }

        let batch = self.stats.batches + 1;
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let size = records.len();

        match self.sink.insert_many(&records).await {
            Ok(inserted) => {
                if inserted != size {
                    tracing::warn!(batch, size, inserted, "Sink reported a different insert count");
                }
                self.stats.batches = batch;
                self.stats.records += inserted;
                tracing::debug!(batch, size, "Batch flushed");
                Ok(BatchOutcome { batch, size, inserted })
            }
            Err(source) => {
                let failed_subjects = match &source {
                    SinkError::Partial { inserted, failures } => {
                        self.stats.records += inserted;
                        failures
                            .iter()
                            .filter_map(|(i, _)| records.get(*i))
                            .map(|r| r.subject_id.clone())
                            .collect()
                    }
                    _ => records.iter().map(|r| r.subject_id.clone()).collect(),
                };
                tracing::error!(batch, size, error = %source, "Batch flush failed");
                Err(BatchError {
                    batch,
                    size,
                    failed_subjects,
                    source,
                })
            }
        }
    }

    /// Flush the remaining partial batch.
    pub async fn finalize(&mut self) -> Result<LoaderStats, BatchError> {
        self.flush().await?;
        Ok(self.stats)
    }

    /// Drop buffered records without writing them. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
