//! Curation run orchestration.
//!
//! A [`CurationPipeline`] drives one byte stream through header resolution,
//! value coercion, record assembly and batched loading, and keeps the job
//! record in step with its state:
//!
//! ```text
//! Idle -> HeaderPending -> Resolving -> Streaming -> Finalizing -> Finished
//!   \__________\______________\____________\____________\-----> Errored | Cancelled
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use curator::{cancellation, CurationPipeline, CurationOptions};
//!
//! let (handle, signal) = cancellation();
//! let mut pipeline = CurationPipeline::new(job_id, dictionaries, sink, jobs, CurationOptions::default());
//! let report = pipeline.run(file_chunks(file, DEFAULT_CHUNK_SIZE), signal).await;
//! println!("{} records in {} batches", report.records_written, report.batches_flushed);
//! ```

use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};

use super::assemble::RecordAssembler;
use super::coerce::ValueCoercer;
use super::header::HeaderResolver;
use super::loader::BulkLoader;
use crate::api::logs::{log_error, log_info, log_success, log_warning};
use crate::config::CurationOptions;
use crate::dictionary::Dictionaries;
use crate::error::{InvalidHeaders, PipelineError, PipelineResult, StreamError};
use crate::models::JobStatus;
use crate::parser::{Row, RowStream};
use crate::store::{JobStore, RecordSink};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineState {
    Idle,
    HeaderPending,
    Resolving,
    Streaming,
    Finalizing,
    Finished,
    Errored,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Errored | Self::Cancelled)
    }

    /// Whether `next` may follow this state.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Errored | Cancelled)
                | (Idle, HeaderPending)
                | (HeaderPending, Resolving)
                | (Resolving, Streaming)
                | (Streaming, Finalizing)
                | (Finalizing, Finished)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Requests cancellation of a run. Cloneable.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observed by a run to stop promptly.
#[derive(Debug)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested. Pends forever if every
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

/// Create a connected cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx: Some(rx) })
}

// =============================================================================
// Report
// =============================================================================

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationReport {
    pub job_id: String,
    pub state: PipelineState,
    /// Data rows assembled into records.
    pub rows_processed: usize,
    /// Records accepted by the sink.
    pub records_written: usize,
    pub batches_flushed: usize,
    /// Full diagnostic of an errored run.
    pub error: Option<String>,
}

impl CurationReport {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Finished
    }
}

/// How a run stopped before finishing.
enum Halt {
    Cancelled(&'static str),
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled(reason) => Halt::Cancelled(reason),
            PipelineError::Stream(StreamError::Aborted(e)) => {
                tracing::warn!(error = %e, "Input stream aborted");
                Halt::Cancelled("input stream aborted")
            }
            other => Halt::Failed(other),
        }
    }
}

/// Cancellation and deadline, observed only where the run reads input.
///
/// A bulk write that has started always completes before the run stops.
struct Gate {
    cancel: CancelSignal,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl Gate {
    fn new(cancel: CancelSignal, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timeout,
        }
    }

    /// Fails if the run was cancelled or ran out of time.
    fn check(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("cancellation requested"));
        }
        if Instant::now() >= self.deadline.deadline() {
            return Err(PipelineError::TimedOut(self.timeout.as_secs()));
        }
        Ok(())
    }

    async fn wait_for_data<S, B>(&mut self, rows: &mut RowStream<S>) -> PipelineResult<bool>
    where
        S: Stream<Item = io::Result<B>>,
        B: AsRef<[u8]>,
    {
        let secs = self.timeout.as_secs();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled("cancellation requested")),
            _ = &mut self.deadline => Err(PipelineError::TimedOut(secs)),
            ready = rows.wait_for_data() => Ok(ready?),
        }
    }

    async fn next_row<S, B>(&mut self, rows: &mut RowStream<S>) -> PipelineResult<Option<Row>>
    where
        S: Stream<Item = io::Result<B>>,
        B: AsRef<[u8]>,
    {
        let secs = self.timeout.as_secs();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled("cancellation requested")),
            _ = &mut self.deadline => Err(PipelineError::TimedOut(secs)),
            row = rows.next_row() => Ok(row?),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// One curation run for one job.
pub struct CurationPipeline {
    job_id: String,
    dictionaries: Arc<Dictionaries>,
    sink: Arc<dyn RecordSink>,
    jobs: Arc<dyn JobStore>,
    options: CurationOptions,
    state: PipelineState,
    history: Vec<PipelineState>,
    rows_processed: usize,
}

impl CurationPipeline {
    pub fn new(
        job_id: impl Into<String>,
        dictionaries: Arc<Dictionaries>,
        sink: Arc<dyn RecordSink>,
        jobs: Arc<dyn JobStore>,
        options: CurationOptions,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            dictionaries,
            sink,
            jobs,
            options,
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
            rows_processed: 0,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Run the pipeline over `source` to a terminal state.
    ///
    /// Never returns an error: failures end in [`PipelineState::Errored`]
    /// and are recorded on the job and in the report.
    #[tracing::instrument(name = "curation", skip_all, fields(job_id = %self.job_id))]
    pub async fn run<S, B>(&mut self, source: S, cancel: CancelSignal) -> CurationReport
    where
        S: Stream<Item = io::Result<B>>,
        B: AsRef<[u8]>,
    {
        if self.state != PipelineState::Idle {
            tracing::warn!(state = %self.state, "Pipeline already ran");
            return self.report(None);
        }

        let mut gate = Gate::new(cancel, self.options.timeout());
        let mut rows = RowStream::new(source);
        let mut loader = BulkLoader::new(self.sink.clone(), self.options.batch_size);

        let result = self
            .drive(&mut rows, &mut loader, &mut gate)
            .await
            .map_err(Halt::from);

        let stats = loader.stats();
        let error = match result {
            Ok(()) => {
                self.transition(PipelineState::Finished);
                log_success(
                    &self.job_id,
                    format!(
                        "Curation finished: {} rows, {} records in {} batches",
                        self.rows_processed, stats.records, stats.batches
                    ),
                );
                self.record_status(JobStatus::Finished, None).await;
                None
            }
            Err(Halt::Cancelled(reason)) => {
                let dropped = loader.discard();
                self.transition(PipelineState::Cancelled);
                log_warning(
                    &self.job_id,
                    format!("Curation cancelled ({}), {} buffered records dropped", reason, dropped),
                );
                self.record_status(JobStatus::Cancelled, None).await;
                None
            }
            Err(Halt::Failed(err)) => {
                let dropped = loader.discard();
                self.transition(PipelineState::Errored);
                log_error(&self.job_id, format!("Curation failed: {}", err));
                if dropped > 0 {
                    tracing::debug!(dropped, "Discarded buffered records");
                }
                self.record_status(JobStatus::Error, Some(err.job_message())).await;
                Some(err.to_string())
            }
        };

        CurationReport {
            records_written: stats.records,
            batches_flushed: stats.batches,
            ..self.report(error)
        }
    }

    async fn drive<S, B>(
        &mut self,
        rows: &mut RowStream<S>,
        loader: &mut BulkLoader,
        gate: &mut Gate,
    ) -> PipelineResult<()>
    where
        S: Stream<Item = io::Result<B>>,
        B: AsRef<[u8]>,
    {
        let dictionaries = self.dictionaries.snapshot()?;

        // Idle -> HeaderPending
        if !gate.wait_for_data(rows).await? {
            return Err(InvalidHeaders::Empty.into());
        }
        self.transition(PipelineState::HeaderPending);
        self.jobs
            .update_status(&self.job_id, JobStatus::Processing, None)
            .await?;
        log_info(&self.job_id, "Receiving data");

        // HeaderPending -> Resolving
        let header = gate.next_row(rows).await?.ok_or(InvalidHeaders::Empty)?;
        self.transition(PipelineState::Resolving);
        let columns = HeaderResolver::new(dictionaries).resolve(&header)?.into_specs()?;
        log_info(&self.job_id, format!("Header resolved: {} field columns", columns.len()));

        // Resolving -> Streaming
        self.transition(PipelineState::Streaming);
        let assembler = RecordAssembler::new(self.options.layout, &self.job_id, &self.options.study_id);
        let coercer = ValueCoercer::new(self.options.null_markers.clone());

        while let Some(cells) = gate.next_row(rows).await? {
            let record = assembler.assemble(rows.row_number(), &cells, &columns, &coercer)?;
            self.rows_processed += 1;
            if let Some(outcome) = loader.add(record).await? {
                log_info(
                    &self.job_id,
                    format!("Batch {} written ({} records)", outcome.batch, outcome.size),
                );
            }
        }

        // Streaming -> Finalizing
        gate.check()?;
        self.transition(PipelineState::Finalizing);
        let pending = loader.buffered();
        let stats = loader.finalize().await?;
        if pending > 0 {
            log_info(
                &self.job_id,
                format!("Batch {} written ({} records)", stats.batches, pending),
            );
        }
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "Ignoring invalid state transition");
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
        self.history.push(next);
    }

    async fn record_status(&self, status: JobStatus, error: Option<String>) {
        if let Err(e) = self.jobs.update_status(&self.job_id, status, error).await {
            tracing::error!(error = %e, %status, "Failed to record job status");
        }
    }

    fn report(&self, error: Option<String>) -> CurationReport {
        CurationReport {
            job_id: self.job_id.clone(),
            state: self.state,
            rows_processed: self.rows_processed,
            records_written: 0,
            batches_flushed: 0,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SinkError, SinkResult, INFRASTRUCTURE_MESSAGE};
    use crate::models::{
        CodingEntry, CuratedValue, CurationJob, CurationRecord, FieldDescriptor, FieldDictionaryEntry,
        RecordLayout, Slot, ValueType,
    };
    use crate::parser::bytes_chunks;
    use crate::store::{MemoryJobStore, MemorySink};
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};

    fn dictionaries() -> Arc<Dictionaries> {
        let field = |field_id, value_type, instances, arrays, coding| FieldDictionaryEntry {
            field_id,
            value_type,
            instance_count: instances,
            array_count: arrays,
            coding_id: coding,
            title: None,
        };
        let coding = |value: &str, meaning: &str| CodingEntry {
            coding_id: 5,
            value: value.into(),
            meaning: meaning.into(),
        };
        Arc::new(
            Dictionaries::from_entries(
                vec![
                    field(40, ValueType::Float, 2, 2, None),
                    field(10, ValueType::CategoricalSingle, 1, 1, Some(5)),
                ],
                vec![coding("1", "Male"), coding("2", "Female")],
            )
            .unwrap(),
        )
    }

    struct Harness {
        pipeline: CurationPipeline,
        sink: Arc<MemorySink>,
        jobs: Arc<MemoryJobStore>,
        job_id: String,
    }

    async fn harness_with(dictionaries: Arc<Dictionaries>, sink: Arc<dyn RecordSink>, options: CurationOptions) -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let job = CurationJob::new("UKBIOBANK", vec!["data.csv".into()]);
        let job_id = job.id.clone();
        jobs.insert(job).await.unwrap();
        let pipeline = CurationPipeline::new(&job_id, dictionaries, sink, jobs.clone(), options);
        Harness {
            pipeline,
            sink: Arc::new(MemorySink::new()),
            jobs,
            job_id,
        }
    }

    async fn harness(options: CurationOptions) -> Harness {
        let sink = Arc::new(MemorySink::new());
        let mut h = harness_with(dictionaries(), sink.clone(), options).await;
        h.sink = sink;
        h
    }

    impl Harness {
        async fn run_csv(&mut self, csv: &str) -> CurationReport {
            self.pipeline.run(bytes_chunks(csv, 7), CancelSignal::never()).await
        }

        async fn job(&self) -> CurationJob {
            self.jobs.get(&self.job_id).await.unwrap().unwrap()
        }
    }

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn insert_many(&self, _records: &[CurationRecord]) -> SinkResult<usize> {
            Err(SinkError::Unavailable("connection reset".into()))
        }
    }

    /// Commits the batch, then takes a while to acknowledge it.
    #[derive(Default)]
    struct SlowSink {
        committed: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl RecordSink for SlowSink {
        async fn insert_many(&self, records: &[CurationRecord]) -> SinkResult<usize> {
            *self.committed.lock().unwrap() += records.len();
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(records.len())
        }
    }

    /// Refuses to mark jobs as processing.
    struct StuckJobStore(MemoryJobStore);

    #[async_trait]
    impl JobStore for StuckJobStore {
        async fn get(&self, job_id: &str) -> crate::error::StoreResult<Option<CurationJob>> {
            self.0.get(job_id).await
        }

        async fn insert(&self, job: CurationJob) -> crate::error::StoreResult<()> {
            self.0.insert(job).await
        }

        async fn update_status(
            &self,
            job_id: &str,
            status: JobStatus,
            error: Option<String>,
        ) -> crate::error::StoreResult<()> {
            if status == JobStatus::Processing {
                return Err(crate::error::StoreError::Unavailable("write concern timeout".into()));
            }
            self.0.update_status(job_id, status, error).await
        }
    }

    #[test]
    fn test_terminal_states_never_move() {
        use PipelineState::*;
        for terminal in [Finished, Errored, Cancelled] {
            for next in [Idle, HeaderPending, Resolving, Streaming, Finalizing, Finished, Errored, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Idle.can_transition_to(HeaderPending));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Cancelled));
    }

    #[tokio::test]
    async fn test_array_field_with_empty_cell() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("id,40-1.0,40-1.1\nP1,3.5,\n").await;

        assert_eq!(report.state, PipelineState::Finished);
        assert_eq!(report.rows_processed, 1);
        assert_eq!(report.records_written, 1);
        let records = h.sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject_id, "P1");
        assert_eq!(records[0].job_id, h.job_id);
        assert_eq!(records[0].value(&FieldDescriptor::new(40, 1, 0)), Some(&CuratedValue::Float(3.5)));
        assert!(records[0].value(&FieldDescriptor::new(40, 1, 1)).is_none());
        assert_eq!(h.job().await.status, JobStatus::Finished);
        assert_eq!(
            h.pipeline.history(),
            &[
                PipelineState::Idle,
                PipelineState::HeaderPending,
                PipelineState::Resolving,
                PipelineState::Streaming,
                PipelineState::Finalizing,
                PipelineState::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_coded_single_value_is_scalar() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("id,10-0.0\nP2,1\n").await;

        assert!(report.is_success());
        let records = h.sink.records().await;
        assert_eq!(records[0].slot(10, 0), Some(&Slot::Scalar(CuratedValue::Text("Male".into()))));
    }

    #[tokio::test]
    async fn test_unknown_field_errors_before_streaming() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("id,99-0.0,abc\nP1,1,2\n").await;

        assert_eq!(report.state, PipelineState::Errored);
        assert_eq!(report.rows_processed, 0);
        assert!(!h.pipeline.history().contains(&PipelineState::Streaming));
        assert!(h.sink.records().await.is_empty());

        let job = h.job().await;
        assert_eq!(job.status, JobStatus::Error);
        let message = job.error.unwrap();
        assert!(message.contains("99-0.0"));
        assert!(message.contains("does not exist"));
        assert!(message.contains("\"abc\" is not a valid field descriptor"));
    }

    #[tokio::test]
    async fn test_bad_numeric_cell_stops_reading() {
        let mut h = harness(CurationOptions::default()).await;
        // an aborted source would end in Cancelled, so reaching it would fail the test
        let chunks: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"id,40-1.0\nP3,abc\n".to_vec()),
            Err(io::Error::new(io::ErrorKind::Other, "must not be read")),
        ];
        let report = h.pipeline.run(stream::iter(chunks), CancelSignal::never()).await;

        assert_eq!(report.state, PipelineState::Errored);
        assert_eq!(report.rows_processed, 0);
        let job = h.job().await;
        assert_eq!(job.status, JobStatus::Error);
        let message = job.error.unwrap();
        assert!(message.contains("\"abc\""));
        assert!(message.contains("40-1.0"));
        assert!(message.contains("row 2"));
    }

    #[tokio::test]
    async fn test_duplicate_columns_error() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("id,40-1.0,40-1.0\nP1,1,2\n").await;

        assert_eq!(report.state, PipelineState::Errored);
        assert!(h.job().await.error.unwrap().contains("Duplicated value"));
    }

    #[tokio::test]
    async fn test_ragged_row_errors() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("id,40-1.0\nP1,1\nP2,1,2\n").await;

        assert_eq!(report.state, PipelineState::Errored);
        assert!(report.error.unwrap().contains("Row 3 has 3 columns but the header has 2"));
    }

    #[tokio::test]
    async fn test_batches_flushed_in_order() {
        let options = CurationOptions {
            batch_size: 2,
            ..CurationOptions::default()
        };
        let mut h = harness(options).await;
        let report = h.run_csv("id,40-0.0\nA,1\nB,2\nC,3\nD,4\nE,5\n").await;

        assert!(report.is_success());
        assert_eq!(report.batches_flushed, 3);
        assert_eq!(report.records_written, 5);
        assert_eq!(h.sink.batch_sizes().await, vec![2, 2, 1]);
        let ids: Vec<_> = h.sink.records().await.into_iter().map(|r| r.subject_id).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D", "E"]);
    }

    #[tokio::test]
    async fn test_cancel_keeps_flushed_batches_only() {
        let options = CurationOptions {
            batch_size: 2,
            ..CurationOptions::default()
        };
        let mut h = harness(options).await;
        let (tx, rx) = futures::channel::mpsc::unbounded::<io::Result<Vec<u8>>>();
        tx.unbounded_send(Ok(b"id,40-0.0\nA,1\nB,2\nC,3\n".to_vec())).unwrap();

        let (handle, signal) = cancellation();
        let sink = h.sink.clone();
        let canceller = async move {
            while sink.batch_sizes().await.is_empty() {
                tokio::task::yield_now().await;
            }
            handle.cancel();
        };

        let (report, ()) = tokio::join!(h.pipeline.run(rx, signal), canceller);
        drop(tx);

        assert_eq!(report.state, PipelineState::Cancelled);
        assert_eq!(h.sink.batch_sizes().await, vec![2]);
        assert_eq!(h.job().await.status, JobStatus::Cancelled);
        assert!(h.job().await.error.is_none());
    }

    #[tokio::test]
    async fn test_aborted_stream_is_cancellation() {
        let mut h = harness(CurationOptions::default()).await;
        let chunks: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"id,40-0.0\nA,1\n".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client disconnected")),
        ];
        let report = h.pipeline.run(stream::iter(chunks), CancelSignal::never()).await;

        assert_eq!(report.state, PipelineState::Cancelled);
        assert!(h.sink.records().await.is_empty());
        assert_eq!(h.job().await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_final_flush_failure() {
        let mut h = harness_with(dictionaries(), Arc::new(FailingSink), CurationOptions::default()).await;
        let report = h.run_csv("id,40-0.0\nA,1\n").await;

        assert_eq!(report.state, PipelineState::Errored);
        assert!(h.pipeline.history().contains(&PipelineState::Finalizing));
        assert!(report.error.unwrap().contains("Batch 1 of 1 records failed"));
        let job = h.job().await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some(INFRASTRUCTURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_unloaded_dictionaries_refused() {
        let sink = Arc::new(MemorySink::new());
        let mut h = harness_with(Arc::new(Dictionaries::new()), sink, CurationOptions::default()).await;
        let report = h.run_csv("id,40-0.0\nA,1\n").await;

        assert_eq!(report.state, PipelineState::Errored);
        assert_eq!(h.pipeline.history(), &[PipelineState::Idle, PipelineState::Errored]);
        assert_eq!(h.job().await.error.as_deref(), Some(INFRASTRUCTURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_empty_input_errors() {
        let mut h = harness(CurationOptions::default()).await;
        let report = h.run_csv("").await;
        assert_eq!(report.state, PipelineState::Errored);
        assert!(report.error.unwrap().contains("empty"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_in_flight_batch() {
        let options = CurationOptions {
            batch_size: 2,
            ..CurationOptions::default()
        };
        let sink = Arc::new(SlowSink::default());
        let mut h = harness_with(dictionaries(), sink.clone(), options).await;
        let source = stream::iter(vec![Ok::<_, io::Error>(b"id,40-0.0\nA,1\nB,2\n".to_vec())])
            .chain(stream::pending());

        let (handle, signal) = cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });
        let report = h.pipeline.run(source, signal).await;

        assert_eq!(report.state, PipelineState::Cancelled);
        assert_eq!(*sink.committed.lock().unwrap(), 2);
        assert_eq!(report.records_written, 2);
        assert_eq!(report.batches_flushed, 1);
        assert_eq!(h.job().await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_job_store_failure_errors_run() {
        let jobs = Arc::new(StuckJobStore(MemoryJobStore::new()));
        let job = CurationJob::new("UKBIOBANK", vec![]);
        let job_id = job.id.clone();
        jobs.insert(job).await.unwrap();

        let sink = Arc::new(MemorySink::new());
        let mut pipeline = CurationPipeline::new(
            &job_id,
            dictionaries(),
            sink.clone(),
            jobs.clone(),
            CurationOptions::default(),
        );
        let report = pipeline.run(bytes_chunks("id,40-0.0\nA,1\n", 64), CancelSignal::never()).await;

        assert_eq!(report.state, PipelineState::Errored);
        assert!(report.error.unwrap().contains("write concern timeout"));
        assert!(sink.records().await.is_empty());
        let job = jobs.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some(INFRASTRUCTURE_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_errors_run() {
        let options = CurationOptions {
            timeout_secs: 5,
            ..CurationOptions::default()
        };
        let mut h = harness(options).await;
        let source = stream::iter(vec![Ok::<_, io::Error>(b"id,40-0.0\n".to_vec())]).chain(stream::pending());
        let report = h.pipeline.run(source, CancelSignal::never()).await;

        assert_eq!(report.state, PipelineState::Errored);
        assert!(report.error.unwrap().contains("timed out after 5 seconds"));
        assert_eq!(h.job().await.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_instance_major_records() {
        let options = CurationOptions {
            layout: RecordLayout::InstanceMajor,
            ..CurationOptions::default()
        };
        let mut h = harness(options).await;
        h.run_csv("id,40-1.0,10-0.0\nP1,2.5,2\n").await;

        let record = &h.sink.records().await[0];
        assert_eq!(record.layout, RecordLayout::InstanceMajor);
        assert!(record.fields[&1].contains_key(&40));
        assert_eq!(record.slot(10, 0), Some(&Slot::Scalar(CuratedValue::Text("Female".into()))));
    }

    #[tokio::test]
    async fn test_pipeline_runs_once() {
        let mut h = harness(CurationOptions::default()).await;
        h.run_csv("id,40-0.0\nA,1\n").await;
        let again = h.run_csv("id,40-0.0\nB,1\n").await;
        assert_eq!(again.state, PipelineState::Finished);
        assert_eq!(h.sink.records().await.len(), 1);
    }
}
