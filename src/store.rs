//! The keyed collection every run is merged into.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{MergeError, MergeErrors};
use crate::merge::{Merge, MergeOptions};
use crate::model::FileCoverage;
use crate::stats::SummarizedStats;
use crate::summary::{sort_paths, SortKey, SortMetric};

/// Absolute file path → merged coverage of that file.
///
/// Single writer: all merges happen on one thread.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoverageStore {
    files: BTreeMap<String, FileCoverage>,
    options: MergeOptions,
}

impl CoverageStore {
    #[must_use]
    pub fn new(options: MergeOptions) -> Self {
        Self {
            files: BTreeMap::new(),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Insert `file`, or merge it into the entry already stored under its
    /// filename. A failed merge leaves the stored entry as it was.
    pub fn merge(&mut self, file: FileCoverage) -> Result<(), MergeError> {
        match self.files.entry(file.filename.clone()) {
            Entry::Vacant(e) => {
                debug!(file = %file.filename, "new file");
                e.insert(file);
                Ok(())
            }
            Entry::Occupied(mut e) => e.get_mut().merge(file, &self.options),
        }
    }

    /// Merge every file, continuing past failures. All failures are
    /// returned together.
    pub fn merge_all<I>(&mut self, files: I) -> Result<(), MergeErrors>
    where
        I: IntoIterator<Item = FileCoverage>,
    {
        let mut errors = MergeErrors::default();
        for file in files {
            if let Err(err) = self.merge(file) {
                warn!(error = %err, "merge failed");
                errors.push(err);
            }
        }
        errors.into_result()
    }

    /// Merge another store into this one.
    pub fn extend(&mut self, other: CoverageStore) -> Result<(), MergeErrors> {
        self.merge_all(other.files.into_values())
    }

    #[must_use]
    pub fn get(&self, filename: &str) -> Option<&FileCoverage> {
        self.files.get(filename)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `(filename, file)` pairs in filename order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileCoverage)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn files(&self) -> impl Iterator<Item = &FileCoverage> {
        self.files.values()
    }

    #[must_use]
    pub fn into_files(self) -> Vec<FileCoverage> {
        self.files.into_values().collect()
    }

    #[must_use]
    pub fn summary(&self) -> SummarizedStats {
        SummarizedStats::from_store(self)
    }

    /// Filenames in display order.
    #[must_use]
    pub fn sorted_filenames(&self, key: SortKey, metric: SortMetric, reverse: bool) -> Vec<&str> {
        sort_paths(
            self.iter()
                .map(|(name, file)| (name, SummarizedStats::from_file(file))),
            key,
            metric,
            reverse,
        )
    }
}
