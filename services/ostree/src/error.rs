//! Errors produced while driving an OSTree repository

use std::process::ExitStatus;

/// Result type for repository operations
pub type OstreeResult<T> = Result<T, OstreeError>;

/// Error types for repository operations
#[derive(Debug, thiserror::Error)]
pub enum OstreeError {
    /// The `ostree` tool could not be spawned, or its output could not be read
    #[error("ostree {command}: {source}")]
    Spawn {
        /// The ostree subcommand
        command: &'static str,

        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The `ostree` tool exited unsuccessfully
    #[error("ostree {command} failed ({status}): {stderr}")]
    Command {
        /// The ostree subcommand
        command: &'static str,

        /// Exit status of the process
        status: ExitStatus,

        /// Captured standard error, trimmed
        stderr: String,
    },

    /// The ref could not be resolved to a commit
    #[error("unknown ref: {0}")]
    UnknownRef(String),

    /// The pull source does not exist or is not a repository
    #[error("invalid pull source: {0}")]
    InvalidSource(String),

    /// The tool produced output which was not valid UTF-8
    #[error("ostree {command} produced non UTF-8 output")]
    Utf8 {
        /// The ostree subcommand
        command: &'static str,
    },

    /// IO error while preparing the repository
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
