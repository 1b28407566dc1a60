//! HTTP server for the curation API.
//!
//! # API Endpoints
//!
//! | Method | Path                                | Description                           |
//! |--------|-------------------------------------|---------------------------------------|
//! | GET    | `/health`                           | Health check                          |
//! | POST   | `/api/studies/{study_id}/curations` | Stream a CSV body through a new job   |
//! | GET    | `/api/jobs/{job_id}`                | Job status and error                  |
//! | POST   | `/api/dictionaries/reload`          | Reload field and coding dictionaries  |
//! | GET    | `/api/logs`                         | SSE stream of job events              |
//!
//! The upload body is consumed as it arrives. If the client goes away
//! before the run ends, the job is cancelled.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{sse::Event, Json, Sse},
    routing::{get, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::{convert::Infallible, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use super::logs::LOG_BROADCASTER;
use super::types::{CurationParams, CurationResponse, DictionaryResponse, LogsQuery};
use crate::config::{CurationOptions, CuratorConfig};
use crate::curation::{cancellation, CancelHandle, CurationPipeline};
use crate::dictionary::Dictionaries;
use crate::error::{ServerError, ServerResult, StoreError};
use crate::models::CurationJob;
use crate::store::{DictionarySource, FileDictionarySource, JobStore, MemoryJobStore, NdjsonSink};

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dictionaries: Arc<Dictionaries>,
    pub source: Arc<dyn DictionarySource>,
    pub jobs: Arc<MemoryJobStore>,
    /// One `<job id>.ndjson` file per job is written here.
    pub output_dir: PathBuf,
    pub options: CurationOptions,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/studies/{study_id}/curations", post(create_curation))
        .route("/api/jobs/{job_id}", get(get_job))
        .route("/api/dictionaries/reload", post(reload_dictionaries))
        .route("/api/logs", get(sse_logs))
        .layer(cors)
        .with_state(state)
}

/// Load the dictionaries and serve until the process stops.
pub async fn start_server(config: CuratorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let source: Arc<dyn DictionarySource> = Arc::new(FileDictionarySource::new(
        &config.fields_path,
        &config.codings_path,
    ));
    let dictionaries = Arc::new(Dictionaries::new());
    let (fields, codings) = dictionaries.load(source.as_ref()).await?;
    tracing::info!(fields, codings, "Dictionaries loaded");

    let state = AppState {
        dictionaries,
        source,
        jobs: Arc::new(MemoryJobStore::new()),
        output_dir: config.output_dir.clone(),
        options: config.options.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, output_dir = %config.output_dir.display(), "Curation server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Health check endpoint
async fn health(State(state): State<AppState>) -> Json<Value> {
    let (fields, codings) = state.dictionaries.sizes();
    Json(json!({
        "status": "ok",
        "service": "ukb-curator",
        "version": env!("CARGO_PKG_VERSION"),
        "dictionariesLoaded": state.dictionaries.is_loaded(),
        "fields": fields,
        "codings": codings,
    }))
}

/// Cancels the wrapped handle when dropped before [`CancelOnDrop::disarm`].
struct CancelOnDrop(Option<CancelHandle>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.cancel();
        }
    }
}

/// Stream the request body through a new curation job.
async fn create_curation(
    State(state): State<AppState>,
    Path(study_id): Path<String>,
    Query(params): Query<CurationParams>,
    body: Body,
) -> ServerResult<(StatusCode, Json<CurationResponse>)> {
    if !state.dictionaries.is_loaded() {
        return Err(ServerError::Unavailable("dictionaries are not loaded".into()));
    }

    let files = params.file_name.into_iter().collect();
    let job = CurationJob::new(&study_id, files);
    let job_id = job.id.clone();
    state.jobs.insert(job).await?;

    let output = state.output_dir.join(format!("{}.ndjson", job_id));
    let sink = NdjsonSink::create(&output).await.map_err(StoreError::from)?;
    tracing::info!(%job_id, %study_id, output = %output.display(), "Curation job created");

    let options = CurationOptions {
        study_id,
        ..state.options.clone()
    };
    let mut pipeline = CurationPipeline::new(
        &job_id,
        state.dictionaries.clone(),
        Arc::new(sink),
        state.jobs.clone(),
        options,
    );

    let chunks = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let (handle, signal) = cancellation();
    let guard = CancelOnDrop(Some(handle));

    // The run owns the body so it reaches a terminal state even if this
    // handler is dropped on disconnect.
    let report = tokio::spawn(async move { pipeline.run(chunks, signal).await })
        .await
        .map_err(|e| ServerError::Internal(format!("curation task failed: {}", e)))?;
    guard.disarm();

    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("job {}", job_id)))?;
    let response = CurationResponse { job, report };
    Ok((response.status_code(), Json(response)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ServerResult<Json<CurationJob>> {
    state
        .jobs
        .get(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("job {}", job_id)))
}

/// Reload both dictionaries from the configured source.
async fn reload_dictionaries(State(state): State<AppState>) -> ServerResult<Json<DictionaryResponse>> {
    let (fields, codings) = state
        .dictionaries
        .load(state.source.as_ref())
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(Json(DictionaryResponse { fields, codings }))
}

/// SSE endpoint for job events
async fn sse_logs(Query(query): Query<LogsQuery>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = LOG_BROADCASTER.subscribe();
    let job_filter = query.job_id;

    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let event = match result {
            Ok(entry) if job_filter.as_ref().map_or(true, |id| *id == entry.job_id) => {
                serde_json::to_string(&entry)
                    .ok()
                    .map(|json| Ok(Event::default().data(json)))
            }
            _ => None,
        };
        futures::future::ready(event)
    });

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldDictionaryEntry, JobStatus, ValueType};
    use crate::curation::PipelineState;
    use crate::store::MemoryDictionarySource;

    fn state(output_dir: PathBuf) -> AppState {
        let source = MemoryDictionarySource::new(
            vec![FieldDictionaryEntry {
                field_id: 40,
                value_type: ValueType::Float,
                instance_count: 2,
                array_count: 2,
                coding_id: None,
                title: None,
            }],
            vec![],
        );
        let dictionaries = Dictionaries::from_entries(source.fields.clone(), vec![]).unwrap();
        AppState {
            dictionaries: Arc::new(dictionaries),
            source: Arc::new(source),
            jobs: Arc::new(MemoryJobStore::new()),
            output_dir,
            options: CurationOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_curation_upload_finishes_job() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path().to_path_buf());
        let params = CurationParams {
            file_name: Some("ukb.csv".into()),
        };

        let (status, Json(response)) = create_curation(
            State(state.clone()),
            Path("STUDY1".into()),
            Query(params),
            Body::from("eid,40-1.0\nP1,3.5\n"),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.report.state, PipelineState::Finished);
        assert_eq!(response.job.status, JobStatus::Finished);
        assert_eq!(response.job.study_id, "STUDY1");
        assert_eq!(response.job.received_files, vec!["ukb.csv"]);

        let written = std::fs::read_to_string(dir.path().join(format!("{}.ndjson", response.job.id))).unwrap();
        assert!(written.contains("\"studyId\":\"STUDY1\""));

        let Json(job) = get_job(State(state), Path(response.job.id.clone())).await.unwrap();
        assert_eq!(job.status, JobStatus::Finished);
    }

    #[tokio::test]
    async fn test_invalid_header_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let (status, Json(response)) = create_curation(
            State(state(dir.path().to_path_buf())),
            Path("STUDY1".into()),
            Query(CurationParams::default()),
            Body::from("eid,99-0.0\nP1,1\n"),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.job.status, JobStatus::Error);
        assert!(response.job.error.unwrap().contains("99-0.0"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = get_job(State(state(dir.path().to_path_buf())), Path("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reload_dictionaries() {
        let dir = tempfile::tempdir().unwrap();
        let Json(sizes) = reload_dictionaries(State(state(dir.path().to_path_buf())))
            .await
            .unwrap();
        assert_eq!(sizes.fields, 1);
        assert_eq!(sizes.codings, 0);
    }
}
