//! Blob operations for the registry

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::api::{Registry, validate_repository};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::range::{ByteRange, parse_range};

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Router for blob operations
pub(crate) fn router() -> Router<Registry> {
    Router::new()
        .route("/v2/{name}/blobs/{digest}", get(get_blob).head(head_blob))
        .route("/v2/{name}/blobs/uploads/", post(start_blob_upload))
        .route(
            "/v2/{name}/blobs/uploads/{uuid}",
            patch(upload_blob_chunk).put(complete_blob_upload),
        )
}

fn blob_headers(digest: &Digest, size: u64) -> [(HeaderName, String); 3] {
    [
        (header::CONTENT_LENGTH, size.to_string()),
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
    ]
}

/// Get a blob
async fn get_blob(
    State(registry): State<Registry>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest = Digest::parse(&digest)?;

    let (file, size) = registry.blobs.open(&digest).await?;
    tracing::debug!(%name, %digest, size, "sending blob");

    Ok((
        StatusCode::OK,
        blob_headers(&digest, size),
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(registry): State<Registry>,
    Path((name, digest)): Path<(String, String)>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;
    let digest = Digest::parse(&digest)?;

    let info = registry.blobs.info(&digest).await?;
    Ok((StatusCode::OK, blob_headers(&digest, info.size)).into_response())
}

/// Start a blob upload session
async fn start_blob_upload(
    State(registry): State<Registry>,
    Path(name): Path<String>,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let uuid = registry.uploads.begin().await?;
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, location),
            (header::CONTENT_RANGE, ByteRange::new(0, 0).content_range(0)),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_UPLOAD_UUID, uuid),
        ],
    )
        .into_response())
}

/// Append a chunk to a blob upload
async fn upload_blob_chunk(
    State(registry): State<Registry>,
    Path((name, uuid)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let length = content_length(&headers);
    let start = match headers.get(header::CONTENT_RANGE) {
        Some(raw) => {
            let raw = raw
                .to_str()
                .map_err(|_| RegistryError::InvalidRange(format!("{raw:?}")))?;
            // The range describes the upload once this chunk is written.
            let current = registry.uploads.size(&uuid).await?;
            let size = match length {
                Some(length) => current.checked_add(length).ok_or_else(|| {
                    RegistryError::InvalidRange(format!("{raw} with length {length}"))
                })?,
                None => u64::MAX,
            };
            Some(chunk_start(raw, size)?)
        }
        None => None,
    };

    let mut payload = body_reader(body);
    let size = registry
        .uploads
        .append_chunk(&uuid, start, &mut payload, length)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/uploads/{uuid}")),
            (header::RANGE, format!("bytes=0-{size}")),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_UPLOAD_UUID, uuid),
        ],
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct FinishQuery {
    digest: Option<String>,
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(registry): State<Registry>,
    Path((name, uuid)): Path<(String, String)>,
    Query(query): Query<FinishQuery>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    validate_repository(&name)?;

    let claimed = query
        .digest
        .as_deref()
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest parameter".to_string()))
        .and_then(Digest::parse)?;

    // Monolithic uploads, or a final chunk, arrive with the request
    let length = content_length(&headers);
    if length != Some(0) {
        let mut payload = body_reader(body);
        registry
            .uploads
            .append_chunk(&uuid, None, &mut payload, length)
            .await?;
    }

    let digest = registry.uploads.finish(&uuid, &claimed).await?;
    tracing::info!(%name, %digest, "upload complete");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (header::CONTENT_LENGTH, "0".to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn body_reader(body: Body) -> impl tokio::io::AsyncRead + Unpin {
    StreamReader::new(body.into_data_stream().map_err(std::io::Error::other))
}

/// Start offset of a chunk from its `Content-Range`, which may omit the
/// `bytes=` unit.
fn chunk_start(raw: &str, size: u64) -> RegistryResult<u64> {
    let spec = if raw.starts_with("bytes=") {
        raw.to_string()
    } else {
        format!("bytes={raw}")
    };

    match parse_range(&spec, size)?.as_slice() {
        [range] => Ok(range.start),
        _ => Err(RegistryError::InvalidRange(raw.to_string())),
    }
}
