//! Explicit configuration, passed by reference into the merge engine and the
//! render adapters.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::merge::{FunctionKeyPolicy, MergeMode, MergeOptions};
use crate::summary::{SortKey, SortMetric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to reconcile functions reported on different lines.
    pub merge_mode: MergeMode,
    pub function_key: FunctionKeyPolicy,
    /// Extraction worker count; 0 means one per available CPU.
    pub jobs: usize,
    /// Project root. Paths below it are written relative to it and
    /// relative paths read back are resolved against it.
    pub root: PathBuf,
    /// Directories taking part in the rollup. Defaults to everything below `root`.
    pub root_filter: Option<String>,
    pub sort_key: SortKey,
    pub sort_metric: SortMetric,
    pub sort_reverse: bool,
    pub show_decision: bool,
    /// Also write which tracefiles contributed to each file.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::default(),
            function_key: FunctionKeyPolicy::default(),
            jobs: 0,
            root: PathBuf::from("."),
            root_filter: None,
            sort_key: SortKey::default(),
            sort_metric: SortMetric::default(),
            sort_reverse: false,
            show_decision: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[must_use]
    pub fn with_merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    #[must_use]
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            mode: self.merge_mode,
            function_key: self.function_key,
        }
    }

    #[must_use]
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }

    /// Absolute, normalized root with forward slashes and no trailing `/`.
    #[must_use]
    pub fn root_dir(&self) -> String {
        let root = if self.root.is_absolute() {
            self.root.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(&self.root)
        };
        let normalized = normalize_path(&root);
        let text = normalized.to_string_lossy().replace('\\', "/");
        if text.len() > 1 {
            text.trim_end_matches('/').to_string()
        } else {
            text
        }
    }

    pub fn root_filter_regex(&self) -> Result<Regex> {
        let pattern = match &self.root_filter {
            Some(pattern) => pattern.clone(),
            None => {
                let root = self.root_dir();
                let root = root.trim_end_matches('/');
                format!("^{}/", regex::escape(root))
            }
        };
        Regex::new(&pattern).with_context(|| format!("Invalid root filter '{pattern}'"))
    }

    /// Path as written to reports: relative when below the root.
    #[must_use]
    pub fn presentable_filename(&self, filename: &str) -> String {
        let root = self.root_dir();
        let prefix = format!("{}/", root.trim_end_matches('/'));
        match filename.strip_prefix(&prefix) {
            Some(rel) => rel.to_string(),
            None => filename.to_string(),
        }
    }

    /// Inverse of [`presentable_filename`](Self::presentable_filename).
    #[must_use]
    pub fn resolve_filename(&self, filename: &str) -> String {
        let path = Path::new(filename);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.root_dir()).join(path)
        };
        normalize_path(&joined)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
