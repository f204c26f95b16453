use std::collections::{HashMap, HashSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{OstreeError, OstreeResult};
use crate::{RepoMode, Repository};

/// Operations recorded by a [`MemoryRepo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Repository::init`]
    Init,
    /// [`Repository::pull_local`]
    PullLocal,
    /// [`Repository::rev_parse`]
    RevParse,
    /// [`Repository::update_summary`]
    UpdateSummary,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Init => f.write_str("init"),
            Operation::PullLocal => f.write_str("pull-local"),
            Operation::RevParse => f.write_str("rev-parse"),
            Operation::UpdateSummary => f.write_str("summary"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    mode: Option<RepoMode>,
    refs: HashMap<String, String>,
    parents: HashMap<String, Option<String>>,
    pulls: Vec<(Utf8PathBuf, String)>,
    summaries: usize,
    log: Vec<Operation>,
    failing: HashSet<Operation>,
}

/// An in-memory repository.
///
/// Every successful pull creates a new commit on the pulled ref, whose parent
/// is the previous head of that ref. Operations can be made to fail with
/// [`MemoryRepo::fail_on`].
#[derive(Debug)]
pub struct MemoryRepo {
    path: Utf8PathBuf,
    inner: Mutex<Inner>,
}

impl MemoryRepo {
    /// Create an empty repository which pretends to live at `path`.
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make every future call of `operation` fail.
    pub fn fail_on(&self, operation: Operation) {
        self.inner.lock().failing.insert(operation);
    }

    /// Operations performed so far, in call order. Failed calls are included.
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().log.clone()
    }

    /// Successful pulls so far, as `(source, ref)` pairs.
    pub fn pulls(&self) -> Vec<(Utf8PathBuf, String)> {
        self.inner.lock().pulls.clone()
    }

    /// Number of summary updates.
    pub fn summaries(&self) -> usize {
        self.inner.lock().summaries
    }

    /// The mode the repository was initialized with, if any.
    pub fn mode(&self) -> Option<RepoMode> {
        self.inner.lock().mode
    }

    fn record(&self, operation: Operation) -> OstreeResult<()> {
        let mut inner = self.inner.lock();
        inner.log.push(operation);
        if inner.failing.contains(&operation) {
            return Err(OstreeError::Io(std::io::Error::other(format!(
                "injected failure: {operation}"
            ))));
        }
        Ok(())
    }
}

impl Inner {
    fn resolve(&self, reference: &str) -> OstreeResult<String> {
        if let Some(base) = reference.strip_suffix('^') {
            let commit = self.resolve(base)?;
            return self
                .parents
                .get(&commit)
                .cloned()
                .flatten()
                .ok_or_else(|| OstreeError::UnknownRef(reference.to_owned()));
        }

        if let Some(commit) = self.refs.get(reference) {
            return Ok(commit.clone());
        }

        if self.parents.contains_key(reference) {
            return Ok(reference.to_owned());
        }

        Err(OstreeError::UnknownRef(reference.to_owned()))
    }
}

#[async_trait::async_trait]
impl Repository for MemoryRepo {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn init(&self, mode: RepoMode) -> OstreeResult<()> {
        self.record(Operation::Init)?;
        tokio::fs::create_dir_all(&self.path).await?;
        self.inner.lock().mode.get_or_insert(mode);
        Ok(())
    }

    async fn pull_local(&self, source: &Utf8Path, reference: &str) -> OstreeResult<()> {
        self.record(Operation::PullLocal)?;

        let is_dir = tokio::fs::metadata(source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(OstreeError::InvalidSource(source.to_string()));
        }

        let mut inner = self.inner.lock();
        let parent = inner.refs.get(reference).cloned();

        let mut hasher = Sha256::new();
        hasher.update(reference.as_bytes());
        hasher.update(parent.as_deref().unwrap_or_default().as_bytes());
        hasher.update(inner.pulls.len().to_le_bytes());
        let commit = hex::encode(hasher.finalize());

        tracing::trace!(%source, %reference, %commit, "memory pull");
        inner.parents.insert(commit.clone(), parent);
        inner.refs.insert(reference.to_owned(), commit);
        inner.pulls.push((source.to_owned(), reference.to_owned()));
        Ok(())
    }

    async fn rev_parse(&self, reference: &str) -> OstreeResult<String> {
        self.record(Operation::RevParse)?;
        self.inner.lock().resolve(reference)
    }

    async fn update_summary(&self) -> OstreeResult<()> {
        self.record(Operation::UpdateSummary)?;
        self.inner.lock().summaries += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
        (tmp, path)
    }

    #[tokio::test]
    async fn pull_then_rev_parse() {
        let (_tmp, source) = source_dir();
        let repo = MemoryRepo::new(source.join("repo"));
        repo.init(RepoMode::Archive).await.unwrap();
        repo.init(RepoMode::Archive).await.unwrap();

        repo.pull_local(&source, "os/x86_64/edge").await.unwrap();
        let first = repo.rev_parse("os/x86_64/edge").await.unwrap();
        assert_eq!(first.len(), 64);

        repo.pull_local(&source, "os/x86_64/edge").await.unwrap();
        let second = repo.rev_parse("os/x86_64/edge").await.unwrap();
        assert_ne!(first, second);

        assert_eq!(repo.parent_commit(&second).await.unwrap(), first);
        assert!(matches!(
            repo.parent_commit(&first).await,
            Err(OstreeError::UnknownRef(_))
        ));
    }

    #[tokio::test]
    async fn pull_from_missing_source() {
        let (_tmp, source) = source_dir();
        let repo = MemoryRepo::new(source.join("repo"));

        let err = repo
            .pull_local(&source.join("missing"), "ref")
            .await
            .unwrap_err();
        assert!(matches!(err, OstreeError::InvalidSource(_)));
        assert!(repo.pulls().is_empty());
    }

    #[tokio::test]
    async fn injected_failure() {
        let (_tmp, source) = source_dir();
        let repo = MemoryRepo::new(source.join("repo"));
        repo.fail_on(Operation::UpdateSummary);

        assert!(repo.update_summary().await.is_err());
        assert_eq!(repo.summaries(), 0);
        assert_eq!(repo.operations(), vec![Operation::UpdateSummary]);
    }
}
