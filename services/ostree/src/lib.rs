//! # OSTree repositories
//!
//! A narrow, async interface to an OSTree repository. The registry only needs
//! four operations from the repository: initialization, pulling a ref from a
//! local source repository, resolving a ref to a commit, and refreshing the
//! published summary.
//!
//! Two implementations are provided:
//!
//! - [`OstreeRepo`] shells out to the `ostree` command line tool.
//! - [`MemoryRepo`] keeps refs in memory, and is used for testing.
//!
//! ## Example
//!
//! ```no_run
//! use ostree::{OstreeRepo, RepoMode, Repository};
//!
//! # async fn example() -> Result<(), ostree::OstreeError> {
//! let repo = OstreeRepo::new("/srv/otto/ostree/repo".into());
//! repo.init(RepoMode::Archive).await?;
//! let commit = repo.rev_parse("fedora/x86_64/iot").await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use camino::Utf8Path;

mod cli;
mod error;
mod memory;

#[doc(inline)]
pub use cli::OstreeRepo;
#[doc(inline)]
pub use error::{OstreeError, OstreeResult};
#[doc(inline)]
pub use memory::{MemoryRepo, Operation};

/// Storage mode of a repository, see `ostree init --mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RepoMode {
    /// Files are stored as-is, owned by their real owners
    Bare,

    /// Files are stored as-is, ownership recorded in xattrs
    BareUser,

    /// Like `bare-user`, but without any ownership or xattr metadata
    BareUserOnly,

    /// Files are stored compressed, suitable for serving over HTTP
    #[default]
    Archive,
}

impl RepoMode {
    /// The name of the mode as accepted by `ostree init --mode`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
            RepoMode::BareUserOnly => "bare-user-only",
            RepoMode::Archive => "archive",
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commit-based filesystem tree repository.
///
/// Mutating operations are not synchronized by implementations. Callers which
/// share one repository between tasks must serialize `pull_local` and
/// `update_summary` themselves.
#[async_trait::async_trait]
pub trait Repository: fmt::Debug + Send + Sync {
    /// Location of the repository on disk.
    fn path(&self) -> &Utf8Path;

    /// Create the repository if it does not exist yet.
    ///
    /// Initializing an existing repository is not an error.
    async fn init(&self, mode: RepoMode) -> OstreeResult<()>;

    /// Pull `reference` from the repository at `source` into this one.
    async fn pull_local(&self, source: &Utf8Path, reference: &str) -> OstreeResult<()>;

    /// Resolve `reference` to a commit checksum.
    async fn rev_parse(&self, reference: &str) -> OstreeResult<String>;

    /// Regenerate the summary file published alongside the repository.
    async fn update_summary(&self) -> OstreeResult<()>;

    /// Resolve the parent of `commit`.
    async fn parent_commit(&self, commit: &str) -> OstreeResult<String> {
        self.rev_parse(&format!("{commit}^")).await
    }
}
