use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A hunk whose header could not be read. Scoped to that one hunk: the
/// rest of the diff is still parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed hunk header on diff line {line}: {header:?}")]
    MalformedHunkHeader { line: usize, header: String },
}

/// A refresh that could not complete. The previously installed record is
/// left untouched when this is returned.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with status {status}")]
    Exit { command: String, status: String },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("diff for {path} exceeds {limit} bytes")]
    DiffTooLarge { path: PathBuf, limit: u64 },

    #[error("failed reading output of `{command}`")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} has no parent directory to run git in")]
    NoParent { path: PathBuf },

    #[error("refresh task for {path} did not finish: {reason}")]
    Task { path: PathBuf, reason: String },
}
