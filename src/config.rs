use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GutterConfig {
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// [diff] section: how diffs are fetched and parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    #[serde(default = "default_context_lines")]
    pub context_lines: u32,
    #[serde(default = "default_true")]
    pub word_diff: bool,
    /// Diff output may be at most this many times the file's size...
    #[serde(default = "default_diff_size_factor")]
    pub diff_size_factor: u64,
    /// ...but never less than this
    #[serde(default = "default_min_diff_bytes")]
    pub min_diff_bytes: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// On a malformed hunk keep the hunks that did parse instead of
    /// publishing an empty map
    #[serde(default)]
    pub keep_partial_on_parse_error: bool,
}

/// [watch] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// [ignore] section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// Glob patterns matched against repo-relative paths; matches are
    /// treated as untracked without asking git
    #[serde(default)]
    pub paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_context_lines() -> u32 {
    1
}

fn default_diff_size_factor() -> u64 {
    4
}

fn default_min_diff_bytes() -> u64 {
    64 * 1024
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_debounce_ms() -> u64 {
    300
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            context_lines: default_context_lines(),
            word_diff: true,
            diff_size_factor: default_diff_size_factor(),
            min_diff_bytes: default_min_diff_bytes(),
            command_timeout_ms: default_command_timeout_ms(),
            keep_partial_on_parse_error: false,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl DiffConfig {
    /// Cap on diff output for a file of `file_size` bytes
    pub fn max_diff_bytes(&self, file_size: u64) -> u64 {
        file_size
            .saturating_mul(self.diff_size_factor)
            .max(self.min_diff_bytes)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl IgnoreConfig {
    /// Whether a repo-relative path matches any ignore pattern. Bad
    /// patterns are skipped.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        self.paths.iter().any(|p| match glob::Pattern::new(p) {
            Ok(pattern) => pattern.matches(relative_path),
            Err(e) => {
                warn!("Invalid ignore pattern {:?}: {}", p, e);
                false
            }
        })
    }
}

/// Load config by merging global defaults with per-repo overrides.
/// Priority: per-repo `.dg-config.toml` > global `~/.config/dg/config.toml` > built-in defaults.
/// Merging is deep: individual fields within sections (e.g. `[diff]`) override independently.
pub fn load_config(repo_root: &Path) -> GutterConfig {
    let global_path = dirs::config_dir().map(|d| d.join("dg/config.toml"));
    load_config_from(global_path.as_deref(), &repo_root.join(".dg-config.toml"))
}

fn load_config_from(global_path: Option<&Path>, local_path: &Path) -> GutterConfig {
    let global_table = global_path.and_then(read_table);
    let local_table = read_table(local_path);

    let merged = match (global_table, local_table) {
        (Some(mut global), Some(local)) => {
            deep_merge(&mut global, local);
            global
        }
        (Some(global), None) => global,
        (None, Some(local)) => local,
        (None, None) => return GutterConfig::default(),
    };

    toml::Value::Table(merged)
        .try_into()
        .unwrap_or_else(|e| {
            warn!("Ignoring invalid config: {}", e);
            GutterConfig::default()
        })
}

fn read_table(path: &Path) -> Option<toml::Table> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<toml::Table>(&content) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// Recursively merge `overlay` into `base`. Overlay values win; nested tables are merged recursively.
fn deep_merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                deep_merge(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
