use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Events emitted by the save watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A watched document was written to disk
    Saved(PathBuf),
}

/// Watches the files of open documents and reports saves, debounced.
///
/// Directories are watched non-recursively, one watch per directory no
/// matter how many of its files are open.
pub struct SaveWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    registry: Registry,
}

impl SaveWatcher {
    pub fn new(debounce_ms: u64, tx: UnboundedSender<WatchEvent>) -> Result<Self> {
        let registry = Registry::default();
        let watched = Arc::clone(&registry.files);

        let debouncer = new_debouncer(
            Duration::from_millis(debounce_ms),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let changed = events
                        .into_iter()
                        .filter(|e| e.kind == DebouncedEventKind::Any)
                        .map(|e| e.path);
                    let saved = {
                        let files = watched.lock().unwrap_or_else(PoisonError::into_inner);
                        filter_saved(changed, &files)
                    };
                    for path in saved {
                        // Receiver gone means the front end is shutting down.
                        let _ = tx.send(WatchEvent::Saved(path));
                    }
                }
                Err(e) => warn!("file watcher error: {e}"),
            },
        )
        .context("Failed to start file watcher")?;

        Ok(Self {
            debouncer,
            registry,
        })
    }

    /// Start reporting saves of `path`
    pub fn watch_file(&mut self, path: &Path) -> Result<()> {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("Cannot watch {}", path.display()))?;
        let watcher = self.debouncer.watcher();
        self.registry
            .add(path, |dir| watcher.watch(dir, RecursiveMode::NonRecursive))
    }

    /// Stop reporting saves of `path` (document closed)
    pub fn unwatch_file(&mut self, path: &Path) -> Result<()> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let watcher = self.debouncer.watcher();
        self.registry.remove(&path, |dir| watcher.unwatch(dir))
    }

    pub fn watched_files(&self) -> usize {
        self.registry.len()
    }
}

/// Watched files plus a per-directory count of them. A file is only
/// recorded once its directory watch is in place.
#[derive(Default)]
struct Registry {
    files: Arc<Mutex<HashSet<PathBuf>>>,
    dirs: HashMap<PathBuf, usize>,
}

impl Registry {
    fn add(
        &mut self,
        path: PathBuf,
        watch_dir: impl FnOnce(&Path) -> notify::Result<()>,
    ) -> Result<()> {
        if self.contains(&path) {
            return Ok(());
        }
        let dir = parent_dir(&path)?;
        if !self.dirs.contains_key(&dir) {
            watch_dir(&dir).with_context(|| format!("Failed to watch {}", dir.display()))?;
        }
        *self.dirs.entry(dir).or_insert(0) += 1;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path);
        Ok(())
    }

    fn remove(
        &mut self,
        path: &Path,
        unwatch_dir: impl FnOnce(&Path) -> notify::Result<()>,
    ) -> Result<()> {
        let removed = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        if !removed {
            return Ok(());
        }

        let dir = parent_dir(path)?;
        if let Some(count) = self.dirs.get_mut(&dir) {
            *count -= 1;
            if *count == 0 {
                self.dirs.remove(&dir);
                unwatch_dir(&dir)
                    .with_context(|| format!("Failed to unwatch {}", dir.display()))?;
            }
        }
        Ok(())
    }

    fn contains(&self, path: &Path) -> bool {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    fn len(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("{} has no parent directory", path.display()))
}

/// Changed paths that belong to watched documents, each reported once.
/// Everything else in a watched directory (editor swap files, `.git/`
/// noise, siblings) is dropped.
fn filter_saved(changed: impl Iterator<Item = PathBuf>, watched: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    changed
        .filter(|p| watched.contains(p))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(paths: &[&str]) -> HashSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn filter_saved_keeps_only_watched_files_once() {
        let watched = set(&["/r/a.rs", "/r/b.rs"]);
        let changed = ["/r/a.rs", "/r/.a.rs.swp", "/r/a.rs", "/r/.git/index", "/r/b.rs"]
            .into_iter()
            .map(PathBuf::from);
        assert_eq!(
            filter_saved(changed, &watched),
            vec![PathBuf::from("/r/a.rs"), PathBuf::from("/r/b.rs")]
        );
    }

    #[test]
    fn filter_saved_nothing_watched() {
        let changed = std::iter::once(PathBuf::from("/r/a.rs"));
        assert!(filter_saved(changed, &HashSet::new()).is_empty());
    }

    #[tokio::test]
    async fn watch_and_unwatch_share_directory_watch() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a\n").unwrap();
        std::fs::write(&b, "b\n").unwrap();

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = SaveWatcher::new(50, tx).unwrap();
        watcher.watch_file(&a).unwrap();
        watcher.watch_file(&b).unwrap();
        watcher.watch_file(&a).unwrap();
        assert_eq!(watcher.watched_files(), 2);
        assert_eq!(watcher.registry.dirs.len(), 1);

        watcher.unwatch_file(&a).unwrap();
        assert_eq!(
            watcher.registry.dirs.values().copied().collect::<Vec<_>>(),
            vec![1]
        );
        watcher.unwatch_file(&b).unwrap();
        assert!(watcher.registry.dirs.is_empty());
        assert_eq!(watcher.watched_files(), 0);
    }

    #[test]
    fn failed_directory_watch_is_retried() {
        let mut registry = Registry::default();
        let path = PathBuf::from("/r/a.rs");

        let err = registry.add(path.clone(), |_| Err(notify::Error::generic("no inotify slots")));
        assert!(err.is_err());
        assert_eq!(registry.len(), 0);
        assert!(registry.dirs.is_empty());

        let mut calls = 0;
        registry
            .add(path.clone(), |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert!(registry.contains(&path));
        assert_eq!(registry.dirs.get(Path::new("/r")), Some(&1));
    }

    #[test]
    fn directory_unwatched_with_its_last_file() {
        let mut registry = Registry::default();
        registry.add(PathBuf::from("/r/a.rs"), |_| Ok(())).unwrap();
        registry.add(PathBuf::from("/r/b.rs"), |_| Ok(())).unwrap();

        let mut unwatched = Vec::new();
        registry
            .remove(Path::new("/r/a.rs"), |d| {
                unwatched.push(d.to_path_buf());
                Ok(())
            })
            .unwrap();
        assert!(unwatched.is_empty());
        registry
            .remove(Path::new("/r/b.rs"), |d| {
                unwatched.push(d.to_path_buf());
                Ok(())
            })
            .unwrap();
        assert_eq!(unwatched, vec![PathBuf::from("/r")]);
    }

    #[test]
    fn watch_missing_file_fails() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = SaveWatcher::new(50, tx).unwrap();
        assert!(watcher.watch_file(Path::new("/definitely/not/here.txt")).is_err());
    }
}
