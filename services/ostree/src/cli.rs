use std::ffi::OsStr;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::process::Command;

use crate::error::{OstreeError, OstreeResult};
use crate::{RepoMode, Repository};

const OSTREE: &str = "ostree";

/// A repository driven through the `ostree` command line tool.
#[derive(Debug, Clone)]
pub struct OstreeRepo {
    path: Utf8PathBuf,
}

impl OstreeRepo {
    /// Refer to the repository at `path`. Nothing is touched on disk until
    /// [`Repository::init`] is called.
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Run `ostree <command> <args...> --repo <path>`, returning stdout.
    async fn run<I, S>(&self, command: &'static str, args: I) -> OstreeResult<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(OSTREE)
            .arg(command)
            .args(args)
            .arg("--repo")
            .arg(&self.path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| OstreeError::Spawn { command, source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            tracing::debug!(command, status = %output.status, %stderr, "ostree failed");
            return Err(OstreeError::Command {
                command,
                status: output.status,
                stderr,
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait::async_trait]
impl Repository for OstreeRepo {
    fn path(&self) -> &Utf8Path {
        &self.path
    }

    #[tracing::instrument(skip(self), fields(repo = %self.path))]
    async fn init(&self, mode: RepoMode) -> OstreeResult<()> {
        tokio::fs::create_dir_all(&self.path).await?;
        self.run("init", ["--mode", mode.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(repo = %self.path))]
    async fn pull_local(&self, source: &Utf8Path, reference: &str) -> OstreeResult<()> {
        self.run("pull-local", [source.as_str(), reference]).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(repo = %self.path))]
    async fn rev_parse(&self, reference: &str) -> OstreeResult<String> {
        let stdout = self.run("rev-parse", [reference]).await?;
        let commit = String::from_utf8(stdout).map_err(|_| OstreeError::Utf8 {
            command: "rev-parse",
        })?;
        let commit = commit.trim();
        tracing::debug!(%reference, %commit, "resolved ref");
        Ok(commit.to_owned())
    }

    #[tracing::instrument(skip(self), fields(repo = %self.path))]
    async fn update_summary(&self) -> OstreeResult<()> {
        self.run("summary", ["-u"]).await?;
        Ok(())
    }
}
