//! External collaborators of the pipeline.
//!
//! The pipeline only talks to storage through these traits:
//!
//! - [`DictionarySource`] - "find all" over the field and coding collections
//! - [`RecordSink`] - bulk insert of curated records
//! - [`JobStore`] - point updates of a job's status and error
//!
//! In-memory implementations live here; file-backed ones in [`file`].

pub mod file;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

use crate::error::{SinkResult, StoreError, StoreResult};
use crate::models::{CodingEntry, CurationJob, CurationRecord, FieldDictionaryEntry, JobStatus};

pub use file::{FileDictionarySource, NdjsonSink};

/// Backing collections of the field and coding dictionaries.
#[async_trait]
pub trait DictionarySource: Send + Sync {
    /// Every field dictionary document.
    async fn fetch_fields(&self) -> StoreResult<Vec<FieldDictionaryEntry>>;

    /// Every coding row.
    async fn fetch_codings(&self) -> StoreResult<Vec<CodingEntry>>;
}

/// Storage collection receiving curated records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert a batch in one operation and return how many documents were written.
    ///
    /// Sinks able to report partial failure return [`crate::error::SinkError::Partial`]
    /// with indices into `records`.
    async fn insert_many(&self, records: &[CurationRecord]) -> SinkResult<usize>;
}

/// Job tracking collection.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &str) -> StoreResult<Option<CurationJob>>;

    async fn insert(&self, job: CurationJob) -> StoreResult<()>;

    /// Set `status` and `error` on an existing job.
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> StoreResult<()>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

/// Dictionary documents held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDictionarySource {
    pub fields: Vec<FieldDictionaryEntry>,
    pub codings: Vec<CodingEntry>,
}

impl MemoryDictionarySource {
    pub fn new(fields: Vec<FieldDictionaryEntry>, codings: Vec<CodingEntry>) -> Self {
        Self { fields, codings }
    }
}

#[async_trait]
impl DictionarySource for MemoryDictionarySource {
    async fn fetch_fields(&self) -> StoreResult<Vec<FieldDictionaryEntry>> {
        Ok(self.fields.clone())
    }

    async fn fetch_codings(&self) -> StoreResult<Vec<CodingEntry>> {
        Ok(self.codings.clone())
    }
}

/// Collects inserted records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CurationRecord>>,
    batches: Mutex<Vec<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records inserted so far, in insertion order.
    pub async fn records(&self) -> Vec<CurationRecord> {
        self.records.lock().await.clone()
    }

    /// Sizes of the batches received so far.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert_many(&self, records: &[CurationRecord]) -> SinkResult<usize> {
        self.records.lock().await.extend_from_slice(records);
        self.batches.lock().await.push(records.len());
        Ok(records.len())
    }
}

/// Jobs held in memory, keyed by id.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, CurationJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self) -> Vec<CurationJob> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: &str) -> StoreResult<Option<CurationJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn insert(&self, job: CurationJob) -> StoreResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job);
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            return Err(StoreError::JobClosed {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        job.status = status;
        job.error = error;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordLayout;

    #[tokio::test]
    async fn test_job_store_updates_status() {
        let store = MemoryJobStore::new();
        let job = CurationJob::new("UKBIOBANK", vec![]);
        let id = job.id.clone();
        store.insert(job).await.unwrap();

        store.update_status(&id, JobStatus::Processing, None).await.unwrap();
        store
            .update_status(&id, JobStatus::Error, Some("bad header".into()))
            .await
            .unwrap();

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("bad header"));
    }

    #[tokio::test]
    async fn test_terminal_job_is_closed() {
        let store = MemoryJobStore::new();
        let job = CurationJob::new("UKBIOBANK", vec![]);
        let id = job.id.clone();
        store.insert(job).await.unwrap();
        store.update_status(&id, JobStatus::Finished, None).await.unwrap();

        let err = store.update_status(&id, JobStatus::Processing, None).await.unwrap_err();
        assert!(matches!(err, StoreError::JobClosed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_job_update_fails() {
        let store = MemoryJobStore::new();
        let err = store.update_status("nope", JobStatus::Processing, None).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order_and_batches() {
        let sink = MemorySink::new();
        let a = CurationRecord::new("A", "j", "s", RecordLayout::FieldMajor);
        let b = CurationRecord::new("B", "j", "s", RecordLayout::FieldMajor);
        sink.insert_many(&[a]).await.unwrap();
        sink.insert_many(&[b]).await.unwrap();

        let ids: Vec<_> = sink.records().await.into_iter().map(|r| r.subject_id).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(sink.batch_sizes().await, vec![1, 1]);
    }
}
