//! Manifest storage
//!
//! Manifests are stored as ordinary blobs. Each one additionally gets a
//! directory under `manifests/`, named by its digest, holding a hard link to
//! the blob.

use camino::Utf8PathBuf;
use tokio::fs::File;

use super::BlobStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::oci::ImageManifest;

const MANIFESTS: &str = "manifests";
const MANIFEST_FILE: &str = "manifest.json";

/// Manifest storage, on top of a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct ManifestStore {
    blobs: BlobStore,
    root: Utf8PathBuf,
}

impl ManifestStore {
    /// Store manifests in `blobs`.
    pub fn new(blobs: BlobStore) -> Self {
        let root = blobs.root().join(MANIFESTS);
        Self { blobs, root }
    }

    /// Create the manifest directory. Safe to call repeatedly.
    pub async fn initialize(&self) -> RegistryResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Path of the manifest with `digest`, whether or not it exists.
    pub fn path_for(&self, digest: &Digest) -> Utf8PathBuf {
        // Store manifests as: manifests/<algorithm>:<hex>/manifest.json
        self.root.join(digest.to_string()).join(MANIFEST_FILE)
    }

    /// Check if a manifest exists
    pub async fn has(&self, digest: &Digest) -> bool {
        tokio::fs::metadata(self.path_for(digest)).await.is_ok()
    }

    /// Store a manifest, after checking that every blob it refers to exists.
    ///
    /// Storing the same manifest again is not an error, and yields the same
    /// digest.
    #[tracing::instrument(skip_all)]
    pub async fn put(&self, manifest: &ImageManifest) -> RegistryResult<Digest> {
        for digest in manifest.references() {
            if !self.blobs.has(digest).await {
                return Err(RegistryError::MissingLayer(digest.clone()));
            }
        }

        let info = self.blobs.put_json(manifest).await?;

        let link = self.path_for(&info.digest);
        if let Some(dir) = link.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        match tokio::fs::hard_link(self.blobs.path_for(&info.digest), &link).await {
            Ok(()) => tracing::debug!(digest = %info.digest, "linked manifest"),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::trace!(digest = %info.digest, "manifest already linked");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(info.digest)
    }

    /// Open a manifest for reading, returning the file and its size.
    pub async fn get(&self, digest: &Digest) -> RegistryResult<(File, u64)> {
        let file = File::open(self.path_for(digest)).await.map_err(|err| {
            RegistryError::not_found_or(err, || RegistryError::ManifestNotFound(digest.to_string()))
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }
}
