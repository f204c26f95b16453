//! Manifest operations for the registry

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio_util::io::ReaderStream;

use crate::api::{Registry, validate_repository};
use crate::blob::DOCKER_CONTENT_DIGEST;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::import::CommitInfo;
use crate::oci::{ImageManifest, MANIFEST_MEDIA_TYPE};

const OSTREE_COMMIT_ID: HeaderName = HeaderName::from_static("ostree-commit-id");

/// Router for manifest operations
pub(crate) fn router() -> Router<Registry> {
    Router::new().route(
        "/v2/{name}/manifests/{reference}",
        get(get_manifest).put(put_manifest),
    )
}

/// Get a manifest by digest
async fn get_manifest(
    State(registry): State<Registry>,
    Path((name, reference)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest = Digest::parse(&reference)?;

    let (file, size) = registry.manifests.get(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE.to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Put a manifest, and import the tree repository commit it describes
async fn put_manifest(
    State(registry): State<Registry>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    validate_manifest_type(content_type)?;

    let manifest: ImageManifest = serde_json::from_slice(&body)
        .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;
    if manifest.schema_version != 2 {
        return Err(RegistryError::InvalidManifest(format!(
            "unsupported schema version {}",
            manifest.schema_version
        )));
    }

    // Reject manifests we cannot import before storing anything
    let commit = CommitInfo::from_manifest(&manifest)?;

    let digest = registry.manifests.put(&manifest).await?;

    let commit_id = {
        let _guard = registry.import_lock.lock().await;
        registry.importer.import(&commit).await?
    };
    tracing::info!(%name, %reference, %digest, commit = %commit_id, "stored manifest");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (OSTREE_COMMIT_ID, commit_id),
        ],
    )
        .into_response())
}

/// Validate manifest type, ignoring any media type parameters
fn validate_manifest_type(content_type: &str) -> RegistryResult<()> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type == MANIFEST_MEDIA_TYPE {
        Ok(())
    } else {
        Err(RegistryError::UnsupportedManifestType(
            content_type.to_string(),
        ))
    }
}
