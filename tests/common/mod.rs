#![allow(dead_code)]

use std::path::{Path, PathBuf};

use covmerge::config::Config;
use covmerge::merge::MergeOptions;
use covmerge::model::{FileCoverage, FunctionCoverage, LineCoverage};
use covmerge::store::CoverageStore;
use tempfile::TempDir;

/// Config rooted at `/proj`, so presented paths are stable across machines.
pub fn config() -> Config {
    Config::default().with_root("/proj")
}

/// Build a file from `(lineno, count)` pairs.
pub fn file_with_lines(filename: &str, lines: &[(u32, u64)]) -> FileCoverage {
    let opts = MergeOptions::default();
    let mut file = FileCoverage::new(filename);
    for &(lineno, count) in lines {
        file.insert_line(LineCoverage::new(lineno, None, count).unwrap(), &opts)
            .unwrap();
    }
    file
}

/// Add a function `name` defined on `lineno` to `file`.
pub fn with_function(mut file: FileCoverage, name: &str, lineno: u32, count: u64) -> FileCoverage {
    file.insert_function(
        FunctionCoverage::new(Some(name), None, lineno, count, 0.0).unwrap(),
        &MergeOptions::default(),
    )
    .unwrap();
    file
}

pub fn store_of(files: Vec<FileCoverage>, options: MergeOptions) -> CoverageStore {
    let mut store = CoverageStore::new(options);
    store.merge_all(files).unwrap();
    store
}

/// Write a JSON tracefile for `files` into `dir`, returning its path.
pub fn write_tracefile(dir: &Path, name: &str, files: Vec<FileCoverage>) -> PathBuf {
    let store = store_of(files, MergeOptions::with_mode(covmerge::merge::MergeMode::Separate));
    let text = covmerge::json::to_json_string(&store, &config()).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

pub fn tempdir() -> TempDir {
    tempfile::tempdir().unwrap()
}
