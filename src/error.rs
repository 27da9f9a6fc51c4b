//! error types for storage, request validation and the http boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures of the durable watermark / log storage.
///
/// Any of these aborts the batch being processed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt watermark at {}: {content:?}", .path.display())]
    CorruptWatermark { path: PathBuf, content: String },

    /// another thread panicked while holding a storage lock
    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Rejections of the request envelope, before any reading is looked at.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request body is not valid json: {0}")]
    InvalidJson(String),

    #[error("request body must be a json object")]
    NotAnObject,

    #[error("`count` is missing or not numeric")]
    BadCount,

    #[error("`data` is missing or not an array")]
    BadData,
}

/// Errors surfaced by the http handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    BadRequest(#[from] RequestError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// the blocking worker died before reporting back
    #[error("batch worker failed: {0}")]
    Worker(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(_) | ApiError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_bad_request() {
        let err = ApiError::from(RequestError::BadData);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "`data` is missing or not an array");
    }

    #[test]
    fn storage_errors_map_to_server_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ApiError::from(StorageError::io(Path::new("/data/node_1.seq"), io));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("/data/node_1.seq"));
    }
}
