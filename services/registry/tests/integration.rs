//! Integration tests for the OCI registry

use std::io::Write;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use camino::{Utf8Path, Utf8PathBuf};
use ostree::{MemoryRepo, Repository};
use registry::RegistryBuilder;
use registry::digest::{Algorithm, Digest};
use registry::import::{LAYER_ANNOTATION, REF_ANNOTATION, REPO_ANNOTATION};
use registry::oci::{CONFIG_MEDIA_TYPE, LAYER_GZIP_MEDIA_TYPE, MANIFEST_MEDIA_TYPE};
use serde_json::json;
use tower::ServiceExt;

const REF: &str = "fedora/x86_64/iot";

struct TestRegistry {
    _tmp: tempfile::TempDir,
    root: Utf8PathBuf,
    repo: Arc<MemoryRepo>,
    app: Router,
}

/// Helper to create a test registry
async fn test_registry() -> TestRegistry {
    let tmp = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
    let repo = Arc::new(MemoryRepo::new(root.join(registry::REPO_DIR)));

    let app = RegistryBuilder::new(root.clone())
        .repository(repo.clone())
        .build()
        .await
        .unwrap();

    TestRegistry {
        _tmp: tmp,
        root,
        repo,
        app,
    }
}

impl TestRegistry {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn begin_upload(&self) -> String {
        let response = self
            .send(
                Request::post("/v2/test-repo/blobs/uploads/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        header_value(&response, header::LOCATION)
    }

    /// Push `data` in a single request, returning its digest.
    async fn push_blob(&self, data: &[u8]) -> Digest {
        let location = self.begin_upload().await;
        let digest = Algorithm::CANONICAL.from_bytes(data);

        let response = self
            .send(
                Request::put(format!("{location}?digest={digest}"))
                    .body(Body::from(data.to_vec()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        digest
    }

    async fn put_manifest(&self, manifest: &serde_json::Value) -> Response<Body> {
        self.send(
            Request::put("/v2/test-repo/manifests/latest")
                .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
                .body(Body::from(serde_json::to_vec(manifest).unwrap()))
                .unwrap(),
        )
        .await
    }
}

fn header_value(response: &Response<Body>, name: impl header::AsHeaderName) -> String {
    response
        .headers()
        .get(name)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn error_code(response: Response<Body>) -> String {
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    body["errors"][0]["code"].as_str().unwrap().to_string()
}

/// A gzip compressed layer holding a tree repository at `/repo`.
fn ostree_layer() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let config = b"[core]\nrepo_version=1\nmode=archive-z2\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(config.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "repo/config", &config[..])
        .unwrap();
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn manifest(config: &Digest, layer: &Digest, layer_nr: &str) -> serde_json::Value {
    json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": config.to_string(),
            "size": 2
        },
        "layers": [{
            "mediaType": LAYER_GZIP_MEDIA_TYPE,
            "digest": layer.to_string(),
            "size": 0
        }],
        "annotations": {
            REPO_ANNOTATION: "/repo",
            REF_ANNOTATION: REF,
            LAYER_ANNOTATION: layer_nr
        }
    })
}

#[tokio::test]
async fn test_api_version_check() {
    let registry = test_registry().await;

    let response = registry
        .send(Request::get("/v2/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"{}");

    let response = registry
        .send(Request::get("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_chunked_upload() {
    let registry = test_registry().await;
    let data = b"Hello, OCI Registry!";
    let digest = Algorithm::CANONICAL.from_bytes(data);

    let response = registry
        .send(
            Request::post("/v2/test-repo/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, header::CONTENT_RANGE), "bytes 0-0/0");
    let location = header_value(&response, header::LOCATION);
    let uuid = header_value(&response, "docker-upload-uuid");
    assert_eq!(location, format!("/v2/test-repo/blobs/uploads/{uuid}"));

    // First chunk, without a range
    let response = registry
        .send(
            Request::patch(&location)
                .body(Body::from(data[..5].to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, header::RANGE), "bytes=0-5");

    // Second chunk, with a bare range
    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, format!("5-{}", data.len() - 1))
                .header(header::CONTENT_LENGTH, data.len() - 5)
                .body(Body::from(data[5..].to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        header_value(&response, header::RANGE),
        format!("bytes=0-{}", data.len())
    );
    assert_eq!(header_value(&response, "docker-upload-uuid"), uuid);

    let response = registry
        .send(
            Request::put(format!("{location}?digest={digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_value(&response, header::LOCATION),
        format!("/v2/test-repo/blobs/{digest}")
    );
    assert_eq!(
        header_value(&response, "docker-content-digest"),
        digest.to_string()
    );

    // The session is gone
    let response = registry
        .send(Request::patch(&location).body(Body::from("more")).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = registry
        .send(
            Request::head(format!("/v2/test-repo/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, header::CONTENT_LENGTH),
        data.len().to_string()
    );
    assert_eq!(
        header_value(&response, header::CONTENT_TYPE),
        "application/octet-stream"
    );
    assert_eq!(
        header_value(&response, "docker-content-digest"),
        digest.to_string()
    );

    let response = registry
        .send(
            Request::get(format!("/v2/test-repo/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, data);
}

#[tokio::test]
async fn test_chunk_at_wrong_offset() {
    let registry = test_registry().await;
    let location = registry.begin_upload().await;

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, "bytes=3-5")
                .header(header::CONTENT_LENGTH, 3)
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");
}

#[tokio::test]
async fn test_chunk_length_overflow() {
    let registry = test_registry().await;
    let location = registry.begin_upload().await;

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_LENGTH, 5)
                .body(Body::from("abcde"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = registry
        .send(
            Request::patch(&location)
                .header(header::CONTENT_RANGE, "5-")
                .header(header::CONTENT_LENGTH, u64::MAX)
                .body(Body::from("f"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    // The session is untouched and can still be finished.
    let digest = Algorithm::CANONICAL.from_bytes(b"abcde");
    let response = registry
        .send(
            Request::put(format!("{location}?digest={digest}"))
                .header(header::CONTENT_LENGTH, 0)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_digest_mismatch() {
    let registry = test_registry().await;
    let location = registry.begin_upload().await;
    let wrong = Algorithm::CANONICAL.from_bytes(b"something else");

    let response = registry
        .send(
            Request::put(format!("{location}?digest={wrong}"))
                .body(Body::from("content"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = registry
        .send(
            Request::head(format!("/v2/test-repo/blobs/{wrong}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blob_not_found() {
    let registry = test_registry().await;
    let digest = Algorithm::CANONICAL.from_bytes(b"never pushed");

    for request in [
        Request::get(format!("/v2/test-repo/blobs/{digest}")),
        Request::head(format!("/v2/test-repo/blobs/{digest}")),
    ] {
        let response = registry.send(request.body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_invalid_digests() {
    let registry = test_registry().await;

    let response = registry
        .send(
            Request::get("/v2/test-repo/blobs/sha256:abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let location = registry.begin_upload().await;
    let response = registry
        .send(
            Request::put(format!("{location}?digest=md5:abc"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = registry
        .send(Request::put(location).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manifest_push_imports_commit() {
    let registry = test_registry().await;
    let config = registry.push_blob(b"{}").await;
    let layer = registry.push_blob(&ostree_layer()).await;

    let response = registry.put_manifest(&manifest(&config, &layer, "0")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let digest = header_value(&response, "docker-content-digest");
    assert_eq!(
        header_value(&response, header::LOCATION),
        format!("/v2/test-repo/manifests/{digest}")
    );
    let commit = header_value(&response, "ostree-commit-id");
    assert_eq!(commit, registry.repo.rev_parse(REF).await.unwrap());
    assert_eq!(registry.repo.summaries(), 1);

    let pulls = registry.repo.pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].1, REF);

    // Scratch directories are cleaned up
    let leftovers = std::fs::read_dir(&registry.root)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".import-"))
        .count();
    assert_eq!(leftovers, 0);

    let response = registry
        .send(
            Request::get(format!("/v2/test-repo/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, header::CONTENT_TYPE),
        MANIFEST_MEDIA_TYPE
    );
    let body = body_bytes(response).await;
    assert_eq!(Algorithm::CANONICAL.from_bytes(&body).to_string(), digest);

    // Pushing again yields the same manifest, and a new commit on the ref
    let response = registry.put_manifest(&manifest(&config, &layer, "0")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_value(&response, "docker-content-digest"), digest);
    let second = header_value(&response, "ostree-commit-id");
    assert_eq!(registry.repo.parent_commit(&second).await.unwrap(), commit);
}

#[tokio::test]
async fn test_manifest_missing_layer() {
    let registry = test_registry().await;
    let config = registry.push_blob(b"{}").await;
    let layer = Algorithm::CANONICAL.from_bytes(b"never pushed");

    let response = registry.put_manifest(&manifest(&config, &layer, "0")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_BLOB_UNKNOWN");
    assert!(registry.repo.pulls().is_empty());
}

#[tokio::test]
async fn test_manifest_without_commit() {
    let registry = test_registry().await;
    let config = registry.push_blob(b"{}").await;
    let layer = registry.push_blob(&ostree_layer()).await;

    // One past the last layer
    let response = registry.put_manifest(&manifest(&config, &layer, "1")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");

    let mut unannotated = manifest(&config, &layer, "0");
    unannotated["annotations"] = json!({});
    let response = registry.put_manifest(&unannotated).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let entries = std::fs::read_dir(registry.root.join("oci/manifests"))
        .unwrap()
        .count();
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn test_manifest_content_type() {
    let registry = test_registry().await;
    let config = registry.push_blob(b"{}").await;
    let layer = registry.push_blob(&ostree_layer()).await;

    let response = registry
        .send(
            Request::put("/v2/test-repo/manifests/latest")
                .header(
                    header::CONTENT_TYPE,
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .body(Body::from(
                    serde_json::to_vec(&manifest(&config, &layer, "0")).unwrap(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = registry
        .send(
            Request::put("/v2/test-repo/manifests/latest")
                .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_manifest_not_found() {
    let registry = test_registry().await;
    let digest = Algorithm::CANONICAL.from_bytes(b"{}");

    let response = registry
        .send(
            Request::get(format!("/v2/test-repo/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let response = registry
        .send(
            Request::get("/v2/test-repo/manifests/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_repository() {
    let registry = test_registry().await;

    let response = registry
        .send(
            Request::post("/v2/a..b/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");
}

#[tokio::test]
async fn test_serves_tree_repository() {
    let registry = test_registry().await;
    std::fs::write(registry.repo.path().join("config"), "[core]\n").unwrap();

    let response = registry
        .send(Request::get("/ostree/repo/config").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"[core]\n");
}
