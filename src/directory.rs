//! Directory rollup: a derived tree that sums file statistics bottom-up
//! along the path-prefix hierarchy.
//!
//! Directory names always carry a trailing `/`. Only directories matching
//! the root filter take part, so everything outside the project root is
//! left out of the tree.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

use crate::stats::SummarizedStats;
use crate::store::CoverageStore;
use crate::summary::{sort_paths, SortKey, SortMetric};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    File,
    Directory,
}

/// Aggregate view of everything below one directory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryCoverage {
    pub dirname: String,
    pub parent: Option<String>,
    /// Child filename or dirname → kind.
    pub children: BTreeMap<String, ChildKind>,
    /// Always the sum of all files below, never re-derived from percentages.
    pub stats: SummarizedStats,
}

impl DirectoryCoverage {
    fn new(dirname: &str) -> Self {
        Self {
            dirname: dirname.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryTree {
    dirs: BTreeMap<String, DirectoryCoverage>,
    file_stats: BTreeMap<String, SummarizedStats>,
}

/// `"/a/b/c.c"` → `"/a/b/"`, `"/a/b/"` → `"/a/"`, `"/"` → `None`.
fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.rfind('/').map(|idx| trimmed[..=idx].to_string())
}

impl DirectoryTree {
    pub fn build(store: &CoverageStore, root_filter: &Regex) -> Self {
        let mut tree = DirectoryTree::default();

        for (filename, file) in store.iter() {
            let stats = SummarizedStats::from_file(file);
            tree.file_stats.insert(filename.to_string(), stats);

            let mut child = (filename.to_string(), ChildKind::File);
            let mut dirname = parent_dir(filename);
            while let Some(name) = dirname.filter(|d| root_filter.is_match(d)) {
                let dir = tree
                    .dirs
                    .entry(name.clone())
                    .or_insert_with(|| DirectoryCoverage::new(&name));
                dir.children.insert(child.0.clone(), child.1);
                dir.stats += stats;
                if child.1 == ChildKind::Directory {
                    if let Some(sub) = tree.dirs.get_mut(&child.0) {
                        sub.parent = Some(name.clone());
                    }
                }
                dirname = parent_dir(&name);
                child = (name, ChildKind::Directory);
            }
        }

        tree.collapse();
        tree
    }

    /// Replace directories holding a single element with that element.
    /// Deepest directories are visited first.
    fn collapse(&mut self) {
        let names: Vec<String> = self.dirs.keys().rev().cloned().collect();
        for name in names {
            let Some(dir) = self.dirs.get(&name) else {
                continue;
            };
            if dir.children.len() != 1 {
                continue;
            }
            let Some((child, kind)) = dir.children.iter().next().map(|(k, v)| (k.clone(), *v))
            else {
                continue;
            };
            match kind {
                ChildKind::File => {
                    let Some(parent) = dir.parent.clone() else {
                        continue;
                    };
                    debug!(file = %child, to = %parent, "moving file up");
                    if let Some(p) = self.dirs.get_mut(&parent) {
                        p.children.remove(&name);
                        p.children.insert(child, ChildKind::File);
                    }
                    self.dirs.remove(&name);
                }
                ChildKind::Directory => {
                    debug!(from = %child, to = %name, "adopting children");
                    let Some(only) = self.dirs.remove(&child) else {
                        continue;
                    };
                    for (grandchild, kind) in &only.children {
                        if *kind == ChildKind::Directory {
                            if let Some(sub) = self.dirs.get_mut(grandchild) {
                                sub.parent = Some(name.clone());
                            }
                        }
                    }
                    if let Some(dir) = self.dirs.get_mut(&name) {
                        dir.children = only.children;
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, dirname: &str) -> Option<&DirectoryCoverage> {
        self.dirs.get(dirname)
    }

    /// Directories without a parent.
    pub fn roots(&self) -> impl Iterator<Item = &DirectoryCoverage> {
        self.dirs.values().filter(|d| d.parent.is_none())
    }

    pub fn children(&self, dirname: &str) -> impl Iterator<Item = (&str, ChildKind)> {
        self.dirs
            .get(dirname)
            .into_iter()
            .flat_map(|d| d.children.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryCoverage> {
        self.dirs.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Statistics of a directory or of a file known to the tree.
    #[must_use]
    pub fn stats(&self, name: &str) -> Option<SummarizedStats> {
        self.dirs
            .get(name)
            .map(|d| d.stats)
            .or_else(|| self.file_stats.get(name).copied())
    }

    /// Children of `dirname` in display order.
    #[must_use]
    pub fn sorted_children(
        &self,
        dirname: &str,
        key: SortKey,
        metric: SortMetric,
        reverse: bool,
    ) -> Vec<&str> {
        let entries = self
            .children(dirname)
            .filter_map(|(name, _)| self.stats(name).map(|s| (name, s)));
        sort_paths(entries, key, metric, reverse)
    }
}
