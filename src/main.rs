use anyhow::{Context, Result};
use clap::Parser;
use diff_gutter::app::{self, DiffRecord, DiffRefreshCoordinator, DiffStateStore, DocumentId};
use diff_gutter::config::{self, GutterConfig};
use diff_gutter::git::{GitClient, VersionControlClient};
use diff_gutter::watch::{SaveWatcher, WatchEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Per-line git change markers for files in a working tree
#[derive(Parser)]
#[command(name = "dg", version, about)]
struct Cli {
    /// Files to annotate
    #[arg(required_unless_present = "print_config")]
    paths: Vec<PathBuf>,

    /// Print each record as JSON
    #[arg(long)]
    json: bool,

    /// Print the next changed line after LINE
    #[arg(long, value_name = "LINE", conflicts_with = "prev")]
    next: Option<usize>,

    /// Print the previous changed line before LINE
    #[arg(long, value_name = "LINE")]
    prev: Option<usize>,

    /// Keep running and reprint whenever a file is saved
    #[arg(long)]
    watch: bool,

    /// Print the effective config as TOML and exit
    #[arg(long)]
    print_config: bool,
}

/// One open file: its stable id and the path git is asked about
struct Document {
    id: DocumentId,
    path: PathBuf,
    display: String,
}

#[derive(Serialize)]
struct Report<'a> {
    path: &'a str,
    #[serde(flatten)]
    record: &'a DiffRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let probe = GitClient::default();
    let cwd = std::env::current_dir().context("Cannot read current directory")?;
    // repo_root looks at the parent directory, so any name under cwd works
    let anchor = cli
        .paths
        .first()
        .cloned()
        .unwrap_or_else(|| cwd.join(".dg-config.toml"));
    let config_root = match probe.repo_root(&anchor).await {
        Ok(root) => root,
        Err(e) => {
            info!("not in a git repository ({e}), using {}", cwd.display());
            cwd.clone()
        }
    };
    let config = config::load_config(&config_root);

    if cli.print_config {
        let text = toml::to_string_pretty(&config).context("Failed to serialize config")?;
        print!("{text}");
        return Ok(());
    }

    if cli.watch && !config.watch.enabled {
        anyhow::bail!("--watch needs [watch] enabled = true");
    }

    let documents = open_documents(&cli.paths)?;
    let client = GitClient::new(config.diff.command_timeout());
    let store = Arc::new(DiffStateStore::new());
    let coordinator = DiffRefreshCoordinator::new(client, store, config.clone());

    let mut failed = 0;
    let handles: Vec<_> = documents
        .iter()
        .map(|doc| coordinator.request_refresh(doc.id, doc.path.clone()))
        .collect();
    for (doc, handle) in documents.iter().zip(handles) {
        match handle.wait().await {
            Ok(_) => print_document(&cli, &coordinator, doc)?,
            Err(e) => {
                failed += 1;
                eprintln!("dg: {}: {e}", doc.display);
            }
        }
    }

    if cli.watch {
        watch_loop(&cli, &coordinator, &config, &documents).await?;
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) could not be refreshed", documents.len());
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("DG_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_documents(paths: &[PathBuf]) -> Result<Vec<Document>> {
    paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let absolute = std::fs::canonicalize(path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            Ok(Document {
                id: DocumentId(i as u64),
                path: absolute,
                display: path.display().to_string(),
            })
        })
        .collect()
}

fn print_document<C: VersionControlClient>(
    cli: &Cli,
    coordinator: &DiffRefreshCoordinator<C>,
    doc: &Document,
) -> Result<()> {
    let store = coordinator.store();
    let record = store.get(doc.id);
    let next = cli.next.and_then(|line| app::next_change(store, doc.id, line));
    let previous = cli.prev.and_then(|line| app::previous_change(store, doc.id, line));

    if cli.json {
        let report = Report {
            path: &doc.display,
            record: &record,
            next,
            previous,
        };
        println!("{}", serde_json::to_string(&report).context("Failed to serialize record")?);
        return Ok(());
    }

    if cli.next.is_some() || cli.prev.is_some() {
        let found = next.or(previous);
        match found {
            Some(line) => println!("{}: {line}", doc.display),
            None => println!("{}: -", doc.display),
        }
        return Ok(());
    }

    println!("{}", summary_line(&doc.display, &record));
    for (line, kind) in record.annotations.iter() {
        println!("{line:>6} {}", kind.symbol());
    }
    Ok(())
}

fn summary_line(display: &str, record: &DiffRecord) -> String {
    if !record.tracked {
        return format!("{display} (not tracked)");
    }
    let branch = if record.branch.is_empty() {
        String::new()
    } else {
        format!(" [{}]", record.branch)
    };
    format!(
        "{display}{branch} +{} -{}",
        record.insertions, record.deletions
    )
}

async fn watch_loop<C: VersionControlClient>(
    cli: &Cli,
    coordinator: &DiffRefreshCoordinator<C>,
    config: &GutterConfig,
    documents: &[Document],
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = SaveWatcher::new(config.watch.debounce_ms, tx)?;
    let by_path: HashMap<&Path, &Document> = documents
        .iter()
        .map(|doc| (doc.path.as_path(), doc))
        .collect();
    for doc in documents {
        watcher.watch_file(&doc.path)?;
    }
    info!(files = watcher.watched_files(), "watching for saves");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(WatchEvent::Saved(path)) = event else {
                    break;
                };
                let Some(doc) = by_path.get(path.as_path()) else {
                    continue;
                };
                match coordinator.request_refresh(doc.id, doc.path.clone()).wait().await {
                    Ok(_) => print_document(cli, coordinator, doc)?,
                    Err(e) => warn!(path = %doc.display, "refresh after save failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for doc in documents {
        watcher.unwatch_file(&doc.path)?;
        coordinator.store().close(doc.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use diff_gutter::ChangeKind;

    #[test]
    fn cli_parses_navigation_flags() {
        let cli = Cli::try_parse_from(["dg", "--next", "12", "a.rs", "b.rs"]).unwrap();
        assert_eq!(cli.next, Some(12));
        assert_eq!(cli.paths, vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")]);
    }

    #[test]
    fn cli_requires_paths_unless_printing_config() {
        assert!(Cli::try_parse_from(["dg"]).is_err());
        assert!(Cli::try_parse_from(["dg", "--print-config"]).is_ok());
    }

    #[test]
    fn cli_rejects_next_with_prev() {
        assert!(Cli::try_parse_from(["dg", "--next", "1", "--prev", "2", "a.rs"]).is_err());
    }

    #[test]
    fn summary_line_formats() {
        let record = DiffRecord {
            tracked: true,
            annotations: [(3, ChangeKind::Addition)].into_iter().collect(),
            insertions: 2,
            deletions: 1,
            branch: "main".to_string(),
            diff_hash: String::new(),
        };
        assert_eq!(summary_line("src/a.rs", &record), "src/a.rs [main] +2 -1");
        assert_eq!(
            summary_line("x", &DiffRecord::untracked()),
            "x (not tracked)"
        );
    }

    #[test]
    fn report_json_flattens_record() {
        let record = DiffRecord {
            tracked: true,
            annotations: [(5, ChangeKind::Modification)].into_iter().collect(),
            insertions: 1,
            deletions: 1,
            branch: "dev".to_string(),
            diff_hash: String::new(),
        };
        let report = Report {
            path: "a.rs",
            record: &record,
            next: Some(5),
            previous: None,
        };
        let value: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["path"], "a.rs");
        assert_eq!(value["annotations"]["5"], "modification");
        assert_eq!(value["next"], 5);
        assert!(value.get("previous").is_none());
        assert!(value.get("diff_hash").is_none());
    }
}
