//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use camino::Utf8PathBuf;
use ostree::{OstreeRepo, RepoMode, Repository};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{RegistryError, RegistryResult};
use crate::import::Importer;
use crate::storage::{BlobStore, ManifestStore, MismatchPolicy, UploadSessions};

/// Directory below the root holding blobs, uploads and manifests
pub const OCI_DIR: &str = "oci";

/// Directory below the root holding the tree repository
pub const REPO_DIR: &str = "ostree/repo";

/// URL prefix the tree repository is published under
pub const REPO_URL: &str = "/ostree/repo";

/// Shared state of the registry handlers.
#[derive(Debug, Clone)]
pub(crate) struct Registry {
    pub(crate) blobs: BlobStore,
    pub(crate) uploads: UploadSessions,
    pub(crate) manifests: ManifestStore,
    pub(crate) importer: Importer,

    // The ostree tool does not support concurrent pulls into one repository.
    pub(crate) import_lock: Arc<Mutex<()>>,
}

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    root: Utf8PathBuf,
    repository: Option<Arc<dyn Repository>>,
    policy: MismatchPolicy,
}

impl RegistryBuilder {
    /// Create a new registry builder, keeping all state below `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            repository: None,
            policy: MismatchPolicy::default(),
        }
    }

    /// Create a registry builder from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.root.clone()).mismatch_policy(config.on_checksum_mismatch)
    }

    /// Set the tree repository layers are imported into.
    ///
    /// Defaults to an [`OstreeRepo`] at `<root>/ostree/repo`.
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set what happens to uploads which fail verification
    pub fn mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the registry service
    ///
    /// Creates the on-disk layout and initializes the tree repository, then
    /// returns a Router that can be served with any tower-compatible server.
    #[tracing::instrument(skip(self), fields(root = %self.root))]
    pub async fn build(self) -> RegistryResult<Router> {
        let blobs = BlobStore::new(self.root.join(OCI_DIR));
        blobs.initialize().await?;

        let manifests = ManifestStore::new(blobs.clone());
        manifests.initialize().await?;

        let uploads = UploadSessions::new(blobs.clone()).with_policy(self.policy);

        let repository = match self.repository {
            Some(repository) => repository,
            None => Arc::new(OstreeRepo::new(self.root.join(REPO_DIR))),
        };
        repository.init(RepoMode::Archive).await?;
        let published = ServeDir::new(repository.path());

        let registry = Registry {
            importer: Importer::new(blobs.clone(), repository, self.root),
            blobs,
            uploads,
            manifests,
            import_lock: Arc::new(Mutex::new(())),
        };

        Ok(Router::new()
            .route("/", get(index))
            .route("/v2/", get(api_version_check))
            .merge(crate::blob::router())
            .merge(crate::manifest::router())
            .nest_service(REPO_URL, published)
            .layer(TraceLayer::new_for_http())
            .with_state(registry))
    }
}

async fn index() -> &'static str {
    "nothing to see here"
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

/// Validate repository name
pub(crate) fn validate_repository(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.contains("..") {
        return Err(RegistryError::InvalidRepository(name.to_string()));
    }
    Ok(())
}
