//! Storage layer for the registry
//!
//! Blobs live on the local filesystem, addressed by content:
//!
//! ```text
//! <root>/blobs/<algorithm>/<hex>               finished blobs
//! <root>/incoming/<name>                       uploads and staging files
//! <root>/manifests/<digest>/manifest.json      links to manifest blobs
//! ```
//!
//! Everything is written into `incoming` first and renamed into place once
//! complete, so a blob at its final path is always whole and correct.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::digest::{Algorithm, CHUNK_SIZE, Digest};
use crate::error::{RegistryError, RegistryResult};

mod manifests;
mod uploads;

pub use manifests::ManifestStore;
pub use uploads::{MismatchPolicy, UploadSessions};

const BLOBS: &str = "blobs";
const INCOMING: &str = "incoming";

/// Size and digest of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Digest the blob is addressed by
    pub digest: Digest,

    /// Size in bytes
    pub size: u64,
}

/// Content addressed blob storage
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: Utf8PathBuf,
    algorithm: Algorithm,
}

impl BlobStore {
    /// Create a blob store rooted at `root`. Call [`BlobStore::initialize`]
    /// before use.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            algorithm: Algorithm::CANONICAL,
        }
    }

    /// The root directory of the store.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The algorithm blobs are addressed by.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn incoming(&self) -> Utf8PathBuf {
        self.root.join(INCOMING)
    }

    /// Create the directory layout. Safe to call repeatedly.
    #[tracing::instrument(skip(self), fields(root = %self.root))]
    pub async fn initialize(&self) -> RegistryResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.root.join(BLOBS).join(self.algorithm.as_str())).await?;
        tokio::fs::create_dir_all(self.incoming()).await?;
        Ok(())
    }

    /// Path of the blob with `digest`, whether or not it exists.
    pub fn path_for(&self, digest: &Digest) -> Utf8PathBuf {
        // Store blobs as: blobs/<algorithm>/<hex>
        let mut path = self.root.join(BLOBS);
        path.push(digest.algorithm().as_str());
        path.push(digest.hex());
        path
    }

    /// Check if a blob exists
    pub async fn has(&self, digest: &Digest) -> bool {
        tokio::fs::metadata(self.path_for(digest)).await.is_ok()
    }

    /// Size of a blob
    pub async fn info(&self, digest: &Digest) -> RegistryResult<BlobInfo> {
        let metadata = tokio::fs::metadata(self.path_for(digest))
            .await
            .map_err(|err| {
                RegistryError::not_found_or(err, || RegistryError::BlobNotFound(digest.clone()))
            })?;

        Ok(BlobInfo {
            digest: digest.clone(),
            size: metadata.len(),
        })
    }

    /// Open a blob for reading, returning the file and its size.
    pub async fn open(&self, digest: &Digest) -> RegistryResult<(File, u64)> {
        let file = File::open(self.path_for(digest)).await.map_err(|err| {
            RegistryError::not_found_or(err, || RegistryError::BlobNotFound(digest.clone()))
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Store the contents of `reader`, returning where it ended up.
    #[tracing::instrument(skip_all, fields(root = %self.root))]
    pub async fn put<R>(&self, reader: &mut R) -> RegistryResult<BlobInfo>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staged = self
            .incoming()
            .join(format!("blob.{}", uuid::Uuid::new_v4()));

        let result = async {
            let info = self.write_staged(&staged, reader).await?;
            self.promote(&staged, &info.digest).await?;
            Ok::<_, RegistryError>(info)
        }
        .await;

        if result.is_err() {
            remove_staged(&staged).await;
        }

        result
    }

    /// Store `value` in its canonical JSON form.
    ///
    /// The serialization is stable (struct field order, four space indent), so
    /// equal values always produce the same digest.
    pub async fn put_json<T>(&self, value: &T) -> RegistryResult<BlobInfo>
    where
        T: Serialize + ?Sized,
    {
        let data = canonical_json(value)?;
        self.put(&mut data.as_slice()).await
    }

    async fn write_staged<R>(&self, staged: &Utf8Path, reader: &mut R) -> RegistryResult<BlobInfo>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = File::create(staged).await?;
        let mut digester = self.algorithm.digester();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut size = 0u64;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }

        file.flush().await?;
        file.sync_data().await?;

        let digest = digester.finish();
        tracing::trace!(%staged, %digest, size, "staged blob");
        Ok(BlobInfo { digest, size })
    }

    /// Atomically move a complete staging file to its content address.
    pub(crate) async fn promote(&self, staged: &Utf8Path, digest: &Digest) -> RegistryResult<()> {
        let target = self.path_for(digest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(staged, &target).await?;
        tracing::debug!(%digest, "stored blob");
        Ok(())
    }
}

/// Remove a staging file, logging rather than returning any failure.
pub(crate) async fn remove_staged(staged: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(staged).await {
        tracing::debug!(%staged, "unable to remove staging file: {err}");
    }
}

pub(crate) fn canonical_json<T>(value: &T) -> RegistryResult<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let mut data = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut data, formatter);
    value.serialize(&mut serializer)?;
    Ok(data)
}
