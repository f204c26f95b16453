//! Importing manifest layers into the tree repository
//!
//! A manifest which carries the `org.osbuild.ostree.*` annotations points at
//! one of its layers: a tarball containing a tree repository. Importing that
//! layer extracts it into a scratch directory, pulls the annotated ref from it
//! into the served repository, and refreshes the repository summary.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use ostree::Repository;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::oci::ImageManifest;
use crate::storage::BlobStore;

/// Annotation naming the path of the tree repository inside the layer
pub const REPO_ANNOTATION: &str = "org.osbuild.ostree.repo";

/// Annotation naming the ref to import
pub const REF_ANNOTATION: &str = "org.osbuild.ostree.ref";

/// Annotation naming the index of the layer holding the tree repository
pub const LAYER_ANNOTATION: &str = "org.osbuild.ostree.layer_nr";

const SCRATCH_PREFIX: &str = ".import-";

/// What to import, as described by a manifest's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Path of the tree repository inside the layer
    pub source: String,

    /// The ref to pull
    pub reference: String,

    /// The layer containing the tree repository
    pub layer: Digest,
}

impl CommitInfo {
    /// Read the import annotations from `manifest`.
    pub fn from_manifest(manifest: &ImageManifest) -> RegistryResult<Self> {
        let source = required(manifest, REPO_ANNOTATION)?;
        if Utf8Path::new(source)
            .components()
            .any(|component| component == Utf8Component::ParentDir)
        {
            return Err(RegistryError::InvalidManifest(format!(
                "{REPO_ANNOTATION} must stay inside the layer: {source}"
            )));
        }

        let reference = required(manifest, REF_ANNOTATION)?;

        let raw = required(manifest, LAYER_ANNOTATION)?;
        let index: usize = raw.trim().parse().map_err(|_| {
            RegistryError::InvalidManifest(format!("{LAYER_ANNOTATION} is not a layer index: {raw}"))
        })?;

        let layer = manifest.layers.get(index).ok_or_else(|| {
            RegistryError::InvalidManifest(format!(
                "{LAYER_ANNOTATION} is {index}, but the manifest has {} layers",
                manifest.layers.len()
            ))
        })?;

        Ok(Self {
            source: source.to_owned(),
            reference: reference.to_owned(),
            layer: layer.digest.clone(),
        })
    }
}

fn required<'m>(manifest: &'m ImageManifest, key: &str) -> RegistryResult<&'m str> {
    match manifest.annotation(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(RegistryError::InvalidManifest(format!(
            "missing annotation {key}"
        ))),
    }
}

/// Steps of an import, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    /// Unpacking the layer
    Extract,
    /// Pulling the ref into the repository
    PullLocal,
    /// Resolving the ref to a commit
    RevParse,
    /// Regenerating the summary
    UpdateSummary,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportStage::Extract => "extract",
            ImportStage::PullLocal => "pull-local",
            ImportStage::RevParse => "rev-parse",
            ImportStage::UpdateSummary => "update-summary",
        })
    }
}

/// An import which stopped at `stage`.
///
/// Earlier stages are not rolled back.
#[derive(Debug, thiserror::Error)]
#[error("import failed at {stage}: {source}")]
pub struct ImportError {
    stage: ImportStage,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl ImportError {
    fn new(stage: ImportStage, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    fn at(stage: ImportStage) -> impl FnOnce(ostree::OstreeError) -> Self {
        move |err| Self::new(stage, err)
    }

    /// The stage which failed.
    pub fn stage(&self) -> ImportStage {
        self.stage
    }
}

/// Imports layers from a [`BlobStore`] into a tree repository.
#[derive(Debug, Clone)]
pub struct Importer {
    blobs: BlobStore,
    repo: Arc<dyn Repository>,
    workdir: Utf8PathBuf,
}

impl Importer {
    /// Scratch directories are created inside `workdir`, which should be on
    /// the same filesystem as the repository.
    pub fn new(blobs: BlobStore, repo: Arc<dyn Repository>, workdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            blobs,
            repo,
            workdir: workdir.into(),
        }
    }

    /// Import `commit`, returning the commit id its ref now points at.
    #[tracing::instrument(skip_all, fields(reference = %commit.reference, layer = %commit.layer))]
    pub async fn import(&self, commit: &CommitInfo) -> Result<String, ImportError> {
        let layer = self.blobs.path_for(&commit.layer);
        let workdir = self.workdir.clone();

        let scratch = tokio::task::spawn_blocking(move || extract(&layer, &workdir))
            .await
            .map_err(|err| ImportError::new(ImportStage::Extract, io::Error::other(err)))?
            .map_err(|err| ImportError::new(ImportStage::Extract, err))?;

        let root = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            ImportError::new(
                ImportStage::Extract,
                io::Error::new(io::ErrorKind::InvalidData, "scratch path is not UTF-8"),
            )
        })?;
        let source = root.join(commit.source.trim_start_matches('/'));

        self.repo
            .pull_local(&source, &commit.reference)
            .await
            .map_err(ImportError::at(ImportStage::PullLocal))?;

        let id = self
            .repo
            .rev_parse(&commit.reference)
            .await
            .map_err(ImportError::at(ImportStage::RevParse))?;

        self.repo
            .update_summary()
            .await
            .map_err(ImportError::at(ImportStage::UpdateSummary))?;

        tracing::info!(commit = %id, "imported commit");
        Ok(id.trim().to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
    Zstd,
    Uncompressed,
}

impl Compression {
    fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::Uncompressed
        }
    }
}

/// Unpack the tarball at `layer` into a new scratch directory in `workdir`.
fn extract(layer: &Utf8Path, workdir: &Utf8Path) -> io::Result<tempfile::TempDir> {
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(workdir)?;

    let mut reader = BufReader::new(std::fs::File::open(layer)?);
    let compression = Compression::detect(reader.fill_buf()?);
    tracing::debug!(%layer, ?compression, dest = %scratch.path().display(), "extracting layer");

    let decoded: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
        Compression::Uncompressed => Box::new(reader),
    };

    let mut archive = tar::Archive::new(decoded);
    archive.set_preserve_permissions(true);
    archive.unpack(scratch.path())?;

    Ok(scratch)
}
