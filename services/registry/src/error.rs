//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;
use crate::import::ImportError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// Upload session not found
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Malformed, unsatisfiable or multi-range `Content-Range`
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Uploaded content does not match the claimed digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: Digest,
        /// Actual digest
        actual: Digest,
    },

    /// Manifest references a blob which is not in the store
    #[error("manifest references unknown blob: {0}")]
    MissingLayer(Digest),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Importing the manifest's layer into the tree repository failed
    #[error(transparent)]
    Import(#[from] ImportError),

    /// The tree repository could not be prepared
    #[error("repository error: {0}")]
    Repository(#[from] ostree::OstreeError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::ManifestNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::MissingLayer(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            // The content is already staged when the mismatch is found.
            RegistryError::DigestMismatch { .. }
            | RegistryError::Import(_)
            | RegistryError::Repository(_)
            | RegistryError::Json(_)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::InvalidRange(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::MissingLayer(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::UnsupportedManifestType(_) => "MANIFEST_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::Import(_)
            | RegistryError::Repository(_)
            | RegistryError::Json(_)
            | RegistryError::Io(_) => "UNKNOWN",
        }
    }

    /// Map `NotFound` IO errors to a domain error, passing others through.
    pub(crate) fn not_found_or(err: std::io::Error, missing: impl FnOnce() -> Self) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            missing()
        } else {
            err.into()
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, code, "{message}");
        } else {
            tracing::debug!(%status, code, "{message}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}
