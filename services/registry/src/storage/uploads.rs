//! Resumable blob uploads
//!
//! An upload session is a file in the staging area, named by the session id.
//! The length of that file is the session's offset; nothing else is tracked,
//! so sessions survive a restart of the server.

use std::io::SeekFrom;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::BlobStore;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// What to do with an upload whose content does not match the claimed digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchPolicy {
    /// Leave the staged file in place; the session stays resumable.
    #[default]
    Retain,

    /// Remove the staged file; the session ends.
    Discard,
}

/// Upload sessions, staged next to a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct UploadSessions {
    blobs: BlobStore,
    policy: MismatchPolicy,
}

impl UploadSessions {
    /// Manage uploads into `blobs`.
    pub fn new(blobs: BlobStore) -> Self {
        Self {
            blobs,
            policy: MismatchPolicy::default(),
        }
    }

    /// Set the policy for uploads which fail verification.
    pub fn with_policy(mut self, policy: MismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn staged_path(&self, id: &str) -> RegistryResult<Utf8PathBuf> {
        // Only ids we could have handed out are accepted; this also keeps
        // client input out of the path.
        let uuid =
            Uuid::parse_str(id).map_err(|_| RegistryError::BlobUploadUnknown(id.to_string()))?;
        Ok(self.blobs.incoming().join(uuid.hyphenated().to_string()))
    }

    /// Start a new, empty upload and return its id.
    #[tracing::instrument(skip(self))]
    pub async fn begin(&self) -> RegistryResult<String> {
        let id = Uuid::new_v4().hyphenated().to_string();
        File::create(self.blobs.incoming().join(&id)).await?;
        tracing::debug!(%id, "began upload");
        Ok(id)
    }

    /// Open an upload for writing, returning the file and the current size.
    pub async fn resume(&self, id: &str) -> RegistryResult<(File, u64)> {
        let staged = self.staged_path(id)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&staged)
            .await
            .map_err(|err| {
                RegistryError::not_found_or(err, || RegistryError::BlobUploadUnknown(id.to_string()))
            })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Current size of an upload.
    pub async fn size(&self, id: &str) -> RegistryResult<u64> {
        let metadata = tokio::fs::metadata(self.staged_path(id)?)
            .await
            .map_err(|err| {
                RegistryError::not_found_or(err, || RegistryError::BlobUploadUnknown(id.to_string()))
            })?;
        Ok(metadata.len())
    }

    /// Append a chunk to an upload, returning the new size.
    ///
    /// When `start` is given it must match the current size of the upload.
    /// When `length` is given exactly that many bytes are read from `payload`,
    /// and running out early is an error; otherwise `payload` is read to the
    /// end.
    #[tracing::instrument(skip(self, payload))]
    pub async fn append_chunk<R>(
        &self,
        id: &str,
        start: Option<u64>,
        payload: &mut R,
        length: Option<u64>,
    ) -> RegistryResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (mut file, size) = self.resume(id).await?;

        if let Some(start) = start {
            if start != size {
                return Err(RegistryError::InvalidRange(format!(
                    "upload {id} is at offset {size}, chunk starts at {start}"
                )));
            }
        }

        file.seek(SeekFrom::Start(size)).await?;

        let written = match length {
            Some(length) => {
                let written = tokio::io::copy(&mut payload.take(length), &mut file).await?;
                if written < length {
                    file.flush().await?;
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("chunk ended after {written} of {length} bytes"),
                    )
                    .into());
                }
                written
            }
            None => tokio::io::copy(payload, &mut file).await?,
        };

        file.flush().await?;
        tracing::debug!(written, size = size + written, "appended chunk");
        Ok(size + written)
    }

    /// Verify an upload against `claimed` and move it into the blob store.
    ///
    /// The blob is always stored under the store's canonical algorithm, which
    /// is returned. Afterwards the session no longer exists.
    #[tracing::instrument(skip(self, claimed), fields(%claimed))]
    pub async fn finish(&self, id: &str, claimed: &Digest) -> RegistryResult<Digest> {
        let staged = self.staged_path(id)?;
        let mut file = File::open(&staged).await.map_err(|err| {
            RegistryError::not_found_or(err, || RegistryError::BlobUploadUnknown(id.to_string()))
        })?;

        let actual = claimed.algorithm().from_reader(&mut file).await?;
        if actual != *claimed {
            drop(file);
            if self.policy == MismatchPolicy::Discard {
                tracing::warn!(%staged, "discarding upload which failed verification");
                super::remove_staged(&staged).await;
            }
            return Err(RegistryError::DigestMismatch {
                expected: claimed.clone(),
                actual,
            });
        }

        let canonical = if claimed.algorithm() != self.blobs.algorithm() {
            file.seek(SeekFrom::Start(0)).await?;
            self.blobs.algorithm().from_reader(&mut file).await?
        } else {
            actual
        };
        drop(file);

        self.blobs.promote(&staged, &canonical).await?;
        Ok(canonical)
    }
}
