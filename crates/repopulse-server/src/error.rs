use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use repopulse_analysis::AnalysisError;
use repopulse_ingest::IngestError;
use repopulse_store::StoreError;
use serde_json::json;
use thiserror::Error;

/// Error returned by request handlers, rendered as a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How an error is presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Valid request without enough history yet.
    Pending,
    Status(StatusCode),
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadRequest(_) => ErrorClass::Status(StatusCode::BAD_REQUEST),
            Self::NotFound(_) => ErrorClass::Status(StatusCode::NOT_FOUND),
            Self::Analysis(err) => analysis_class(err),
            Self::Ingest(err) => match err {
                IngestError::InvalidRepositoryUrl(_) => ErrorClass::Status(StatusCode::BAD_REQUEST),
                IngestError::UnknownUser(_) => ErrorClass::Status(StatusCode::NOT_FOUND),
                IngestError::AlreadyTracked(_) | IngestError::TrackedByAnotherUser(_) => {
                    ErrorClass::Status(StatusCode::CONFLICT)
                }
                IngestError::OwnershipDenied { .. } => ErrorClass::Status(StatusCode::FORBIDDEN),
                IngestError::Upstream(_) => ErrorClass::Status(StatusCode::BAD_GATEWAY),
                IngestError::Store(err) => store_class(err),
                IngestError::Analysis(err) => analysis_class(err),
            },
            Self::Store(err) => store_class(err),
        }
    }
}

fn analysis_class(err: &AnalysisError) -> ErrorClass {
    match err {
        AnalysisError::InvalidWindowFormat(_) | AnalysisError::InvalidGroupBy(_) => {
            ErrorClass::Status(StatusCode::BAD_REQUEST)
        }
        AnalysisError::SubjectNotFound(_) => ErrorClass::Status(StatusCode::NOT_FOUND),
        AnalysisError::OwnershipDenied { .. } => ErrorClass::Status(StatusCode::FORBIDDEN),
        AnalysisError::Store(err) => store_class(err),
        AnalysisError::NoSnapshotAvailable | AnalysisError::NoBaselineSnapshot => {
            ErrorClass::Pending
        }
    }
}

fn store_class(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::AlreadyExists(_) | StoreError::DuplicateSnapshot { .. } => {
            ErrorClass::Status(StatusCode::CONFLICT)
        }
        _ => ErrorClass::Status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.class() {
            ErrorClass::Pending => (
                StatusCode::OK,
                Json(json!({"status": "pending", "reason": self.to_string()})),
            )
                .into_response(),
            ErrorClass::Status(status) => {
                if status.is_server_error() {
                    tracing::error!(error = %self, status = status.as_u16(), "request failed");
                } else {
                    tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
                }
                (status, Json(json!({"error": self.to_string()}))).into_response()
            }
        }
    }
}
