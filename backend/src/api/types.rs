//! REST API types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::curation::{CurationReport, PipelineState};
use crate::error::{ServerError, INFRASTRUCTURE_MESSAGE};
use crate::models::CurationJob;

/// Query string of a curation upload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationParams {
    /// Name of the uploaded file, recorded on the job.
    pub file_name: Option<String>,
}

/// Query string of the log stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    /// Only stream events of this job.
    pub job_id: Option<String>,
}

/// Response sent once a curation run reaches a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationResponse {
    /// Job record as stored after the run
    pub job: CurationJob,
    pub report: CurationReport,
}

impl CurationResponse {
    /// HTTP status matching the run outcome.
    pub fn status_code(&self) -> StatusCode {
        match self.report.state {
            PipelineState::Errored => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::OK,
        }
    }
}

/// Dictionary sizes after a reload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryResponse {
    pub fields: usize,
    pub codings: usize,
}

/// Create an error response
pub fn error_response(error: &str) -> Value {
    json!({
        "status": "error",
        "error": error,
    })
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Pipeline(_) | ServerError::Store(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            ServerError::NotFound(_) | ServerError::Unavailable(_) => self.to_string(),
            _ => {
                tracing::error!(error = %self, "Request failed");
                INFRASTRUCTURE_MESSAGE.to_string()
            }
        };

        (status, Json(error_response(&message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_error_status_codes() {
        let not_found = ServerError::NotFound("job 42".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let store = ServerError::Store(StoreError::Unavailable("down".into())).into_response();
        assert_eq!(store.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_shape() {
        let value = error_response("Not found: job 42");
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"], "Not found: job 42");
    }
}
