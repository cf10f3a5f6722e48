use super::state::{DiffRecord, DiffStateStore, DocumentId};
use crate::config::GutterConfig;
use crate::error::RefreshError;
use crate::git::{
    self, ChangeKind, DiffFormat, DiffRequest, NumstatEntry, ParsedDiff, VersionControlClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How a refresh ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A fresh tracked record is now in the store
    Installed,
    /// The file is not under version control (or is ignored)
    NotTracked,
    /// A newer refresh landed first, or the document was closed
    Superseded,
}

/// A refresh running in the background
#[derive(Debug)]
pub struct RefreshHandle {
    path: PathBuf,
    task: JoinHandle<Result<RefreshOutcome, RefreshError>>,
}

impl RefreshHandle {
    pub async fn wait(self) -> Result<RefreshOutcome, RefreshError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RefreshError::Task {
                path: self.path,
                reason: e.to_string(),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop waiting on git. Whatever was installed before stays.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Fetches diffs through a [`VersionControlClient`] and installs the
/// parsed result into a [`DiffStateStore`].
pub struct DiffRefreshCoordinator<C> {
    client: Arc<C>,
    store: Arc<DiffStateStore>,
    config: Arc<GutterConfig>,
}

impl<C> Clone for DiffRefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C: VersionControlClient> DiffRefreshCoordinator<C> {
    pub fn new(client: C, store: Arc<DiffStateStore>, config: GutterConfig) -> Self {
        Self {
            client: Arc::new(client),
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<DiffStateStore> {
        &self.store
    }

    pub fn config(&self) -> &GutterConfig {
        &self.config
    }

    /// Start a refresh on the tokio runtime and return immediately.
    ///
    /// The sequence number is taken here, in call order, so a later request
    /// always wins over an earlier one no matter which finishes first.
    pub fn request_refresh(&self, doc: DocumentId, path: impl Into<PathBuf>) -> RefreshHandle {
        let path = path.into();
        let seq = self.store.begin_refresh(doc);
        let this = self.clone();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let result = this.run(doc, seq, &task_path).await;
            if let Err(e) = &result {
                warn!(%doc, path = %task_path.display(), "refresh failed: {e}");
            }
            result
        });
        RefreshHandle { path, task }
    }

    /// Refresh inline, for callers already on an async task
    pub async fn refresh(
        &self,
        doc: DocumentId,
        path: &Path,
    ) -> Result<RefreshOutcome, RefreshError> {
        let seq = self.store.begin_refresh(doc);
        self.run(doc, seq, path).await
    }

    async fn run(
        &self,
        doc: DocumentId,
        seq: u64,
        path: &Path,
    ) -> Result<RefreshOutcome, RefreshError> {
        let Some(previous) = self.store.peek(doc) else {
            // Closed before the refresh got going
            return Ok(RefreshOutcome::Superseded);
        };

        if !previous.tracked && !self.client.is_tracked(path).await? {
            return Ok(self.finish(doc, seq, DiffRecord::untracked(), RefreshOutcome::NotTracked));
        }

        let repo_root = self.client.repo_root(path).await?;
        let relative = relative_path(&repo_root, path).await;
        if self.config.ignore.is_ignored(&relative) {
            debug!(%doc, path = %relative, "ignored by config");
            return Ok(self.finish(doc, seq, DiffRecord::untracked(), RefreshOutcome::NotTracked));
        }

        let diff_config = &self.config.diff;
        let file_size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        let request = DiffRequest {
            context_lines: diff_config.context_lines,
            word_diff: diff_config.word_diff,
            max_bytes: diff_config.max_diff_bytes(file_size),
        };

        let (diff, numstat, branch) = tokio::join!(
            self.client.diff_text(path, &request),
            self.client.numstat(&repo_root),
            self.client.current_branch(&repo_root),
        );
        let diff = diff?;
        let numstat = numstat?;
        let branch = branch.unwrap_or_else(|e| {
            warn!(%doc, "keeping previous branch label: {e}");
            previous.branch.clone()
        });

        let format = if request.word_diff {
            DiffFormat::WordDiff
        } else {
            DiffFormat::Unified
        };
        let parsed = match git::parse_diff(&diff, format) {
            Ok(parsed) => parsed,
            Err(failure) => {
                warn!(%doc, path = %relative, "{failure}: {:?}", failure.errors);
                if diff_config.keep_partial_on_parse_error {
                    failure.partial
                } else {
                    ParsedDiff::default()
                }
            }
        };

        let (insertions, deletions) = reconcile_stats(&relative, &numstat, &parsed);
        debug!(
            %doc,
            path = %relative,
            hunks = parsed.hunks,
            lines = parsed.annotations.len(),
            insertions,
            deletions,
            "parsed diff"
        );

        let record = DiffRecord {
            tracked: true,
            annotations: parsed.annotations,
            insertions,
            deletions,
            branch,
            diff_hash: git::diff_hash(&diff),
        };
        Ok(self.finish(doc, seq, record, RefreshOutcome::Installed))
    }

    fn finish(
        &self,
        doc: DocumentId,
        seq: u64,
        record: DiffRecord,
        outcome: RefreshOutcome,
    ) -> RefreshOutcome {
        if self.store.install(doc, seq, record) {
            outcome
        } else {
            debug!(%doc, seq, "dropping superseded refresh result");
            RefreshOutcome::Superseded
        }
    }
}

/// Numstat is what gets published. The body-derived counts should agree
/// whenever no removed+added pairs were folded into modifications.
fn reconcile_stats(relative: &str, numstat: &[NumstatEntry], parsed: &ParsedDiff) -> (usize, usize) {
    let stats = numstat
        .iter()
        .find(|entry| entry.path == relative)
        .map(|entry| (entry.insertions, entry.deletions))
        .unwrap_or((0, 0));

    let body = (parsed.insertions, parsed.deletions);
    if parsed.annotations.count(ChangeKind::Modification) == 0 && body != stats {
        debug!(
            path = relative,
            numstat = ?stats,
            body = ?body,
            "numstat and diff body disagree"
        );
    }
    stats
}

/// `path` relative to `repo_root` with `/` separators, as numstat prints it
async fn relative_path(repo_root: &Path, path: &Path) -> String {
    let relative = match path.strip_prefix(repo_root) {
        Ok(rel) => Some(rel.to_path_buf()),
        Err(_) => match tokio::fs::canonicalize(path).await {
            Ok(abs) => abs.strip_prefix(repo_root).ok().map(Path::to_path_buf),
            Err(_) => None,
        },
    };
    let relative = relative.unwrap_or_else(|| {
        path.file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf())
    });
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
