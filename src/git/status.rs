use crate::error::RefreshError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Options for a single-file diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRequest {
    pub context_lines: u32,
    pub word_diff: bool,
    /// Output beyond this is refused with [`RefreshError::DiffTooLarge`]
    pub max_bytes: u64,
}

/// One row of `git diff --numstat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumstatEntry {
    pub insertions: usize,
    pub deletions: usize,
    /// Repo-relative path
    pub path: String,
    pub binary: bool,
}

/// Everything the refresh path needs from version control.
///
/// A non-zero exit from the tracked check is the "not tracked" answer and
/// comes back as `Ok(false)`; only real failures are errors.
pub trait VersionControlClient: Send + Sync + 'static {
    fn repo_root(&self, path: &Path) -> impl Future<Output = Result<PathBuf, RefreshError>> + Send;

    fn is_tracked(&self, path: &Path) -> impl Future<Output = Result<bool, RefreshError>> + Send;

    fn diff_text(
        &self,
        path: &Path,
        request: &DiffRequest,
    ) -> impl Future<Output = Result<String, RefreshError>> + Send;

    fn numstat(
        &self,
        repo_root: &Path,
    ) -> impl Future<Output = Result<Vec<NumstatEntry>, RefreshError>> + Send;

    fn current_branch(
        &self,
        repo_root: &Path,
    ) -> impl Future<Output = Result<String, RefreshError>> + Send;
}

/// [`VersionControlClient`] backed by the `git` executable
#[derive(Debug, Clone)]
pub struct GitClient {
    program: String,
    timeout: Duration,
}

impl GitClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            timeout,
        }
    }

    /// Use a different executable (tests, wrappers)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    /// Run to completion and return stdout, or the exit status on failure.
    async fn capture(
        &self,
        dir: &Path,
        args: &[&str],
        limit: Option<u64>,
    ) -> Result<(ExitStatus, Vec<u8>), RefreshError> {
        let command = self.describe(args);
        let mut child = self
            .command(dir, args)
            .spawn()
            .map_err(|source| RefreshError::Spawn {
                command: command.clone(),
                source,
            })?;

        let run = async {
            let mut stdout = Vec::new();
            if let Some(pipe) = child.stdout.take() {
                match limit {
                    Some(limit) => {
                        pipe.take(limit + 1).read_to_end(&mut stdout).await?;
                    }
                    None => {
                        let mut pipe = pipe;
                        pipe.read_to_end(&mut stdout).await?;
                    }
                }
            }
            if limit.is_some_and(|limit| stdout.len() as u64 > limit) {
                child.start_kill()?;
                return Ok((None, stdout));
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((Some(status), stdout))
        };

        match tokio::time::timeout(self.timeout, run).await {
            Err(_) => Err(RefreshError::Timeout {
                command,
                after: self.timeout,
            }),
            Ok(Err(source)) => Err(RefreshError::Io { command, source }),
            Ok(Ok((Some(status), stdout))) => Ok((status, stdout)),
            Ok(Ok((None, _))) => Err(RefreshError::DiffTooLarge {
                path: dir.to_path_buf(),
                limit: limit.unwrap_or_default(),
            }),
        }
    }

    /// Like [`GitClient::capture`] but any non-zero exit is an error.
    async fn capture_ok(&self, dir: &Path, args: &[&str]) -> Result<String, RefreshError> {
        let (status, stdout) = self.capture(dir, args, None).await?;
        if !status.success() {
            return Err(RefreshError::Exit {
                command: self.describe(args),
                status: status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

fn split_path(path: &Path) -> Result<(&Path, String), RefreshError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| RefreshError::NoParent {
            path: path.to_path_buf(),
        })?
        .to_string_lossy()
        .into_owned();
    Ok((dir, name))
}

impl VersionControlClient for GitClient {
    async fn repo_root(&self, path: &Path) -> Result<PathBuf, RefreshError> {
        let (dir, _) = split_path(path)?;
        let out = self
            .capture_ok(dir, &["rev-parse", "--show-toplevel"])
            .await?;
        Ok(PathBuf::from(out.trim()))
    }

    async fn is_tracked(&self, path: &Path) -> Result<bool, RefreshError> {
        let (dir, name) = split_path(path)?;
        let args = ["ls-files", "--error-unmatch", "--", name.as_str()];
        let (status, _) = self.capture(dir, &args, None).await?;
        if !status.success() {
            debug!(path = %path.display(), %status, "not tracked");
        }
        Ok(status.success())
    }

    async fn diff_text(&self, path: &Path, request: &DiffRequest) -> Result<String, RefreshError> {
        let (dir, name) = split_path(path)?;
        let unified = format!("--unified={}", request.context_lines);
        let mut args = vec!["diff", "--no-color", "--no-ext-diff", unified.as_str()];
        if request.word_diff {
            args.push("--word-diff=plain");
        }
        args.extend(["--", name.as_str()]);

        let (status, stdout) = self
            .capture(dir, &args, Some(request.max_bytes))
            .await
            .map_err(|err| match err {
                RefreshError::DiffTooLarge { limit, .. } => RefreshError::DiffTooLarge {
                    path: path.to_path_buf(),
                    limit,
                },
                other => other,
            })?;
        if !status.success() {
            return Err(RefreshError::Exit {
                command: self.describe(&args),
                status: status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn numstat(&self, repo_root: &Path) -> Result<Vec<NumstatEntry>, RefreshError> {
        let out = self.capture_ok(repo_root, &["diff", "--numstat", "-z"]).await?;
        Ok(parse_numstat(&out))
    }

    async fn current_branch(&self, repo_root: &Path) -> Result<String, RefreshError> {
        let out = self
            .capture_ok(repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }
}

/// Parse `git diff --numstat -z` output. Paths arrive unquoted, so they
/// compare equal to repo-relative paths. A rename row has an empty path
/// field followed by the old and new paths; the new path is kept. Binary
/// files report `-` counts and are kept with zero insertions/deletions.
pub fn parse_numstat(raw: &str) -> Vec<NumstatEntry> {
    let mut entries = Vec::new();
    let mut fields = raw.split('\0');

    while let Some(record) = fields.next() {
        if record.is_empty() {
            continue;
        }
        let mut parts = record.splitn(3, '\t');
        let (Some(ins), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let path = if path.is_empty() {
            // Skip the pre-rename path
            fields.next();
            match fields.next() {
                Some(new_path) => new_path,
                None => break,
            }
        } else {
            path
        };

        let binary = ins == "-" && del == "-";
        let (insertions, deletions) = if binary {
            (0, 0)
        } else {
            match (ins.parse::<usize>(), del.parse::<usize>()) {
                (Ok(insertions), Ok(deletions)) => (insertions, deletions),
                _ => continue,
            }
        };

        entries.push(NumstatEntry {
            insertions,
            deletions,
            path: path.to_string(),
            binary,
        });
    }

    entries
}
