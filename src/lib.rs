//! Per-line change markers for files in a git working tree.
//!
//! A [`DiffRefreshCoordinator`] asks git for a file's diff in the
//! background, [`parse_diff`] turns it into [`LineAnnotations`], and the
//! result lands in a [`DiffStateStore`] that front ends read from.

pub mod app;
pub mod config;
pub mod error;
pub mod git;
pub mod watch;

pub use app::{DiffRecord, DiffRefreshCoordinator, DiffStateStore, DocumentId, RefreshOutcome};
pub use error::{ParseError, RefreshError};
pub use git::{parse_diff, ChangeKind, DiffFormat, GitClient, LineAnnotations};
