mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use covmerge::config::Config;
use covmerge::error::CollectError;
use covmerge::ingest::{collect, ingest_tracefile, Extractor, JsonTracefileExtractor};
use covmerge::merge::MergeMode;
use covmerge::model::FileCoverage;
use covmerge::stats::CoverageStat;
use covmerge::store::CoverageStore;

fn jobs(n: usize) -> Config {
    let mut config = common::config();
    config.jobs = n;
    config
}

/// Yields one observation of `/proj/src/a.c` per data file, failing on
/// paths ending in `bad`.
struct FakeExtractor {
    calls: AtomicUsize,
}

impl FakeExtractor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl Extractor for FakeExtractor {
    fn extract(&self, data_file: &Path) -> Result<Vec<FileCoverage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if data_file.ends_with("bad") {
            bail!("corrupt data file");
        }
        Ok(vec![common::file_with_lines("/proj/src/a.c", &[(1, 1), (2, 0)])])
    }
}

#[test]
fn collect_tracefiles_parallel() {
    let dir = common::tempdir();
    let mut paths = Vec::new();
    for i in 0..8u64 {
        paths.push(common::write_tracefile(
            dir.path(),
            &format!("run{i}.json"),
            vec![common::file_with_lines("/proj/src/a.c", &[(1, i), (2, 1)])],
        ));
    }

    let config = jobs(4);
    let store = collect(&paths, &JsonTracefileExtractor::new(&config), &config).unwrap();

    let file = store.get("/proj/src/a.c").unwrap();
    let counts: Vec<u64> = file.lines.values().map(|l| l.count).collect();
    assert_eq!(counts, vec![28, 8]);
    assert_eq!(file.data_sources.len(), 8);
    assert_eq!(store.summary().line, CoverageStat::new(2, 2));
}

#[test]
fn collect_result_independent_of_job_count() {
    let dir = common::tempdir();
    let paths: Vec<PathBuf> = (0..5u64)
        .map(|i| {
            let file = common::with_function(
                common::file_with_lines("/proj/src/b.c", &[(3, i), (4, 0)]),
                "foo",
                3,
                i,
            );
            common::write_tracefile(dir.path(), &format!("t{i}.json"), vec![file])
        })
        .collect();

    let serial = jobs(1);
    let parallel = jobs(3);
    let a = collect(&paths, &JsonTracefileExtractor::new(&serial), &serial).unwrap();
    let b = collect(&paths, &JsonTracefileExtractor::new(&parallel), &parallel).unwrap();
    assert_eq!(a, b);
}

#[test]
fn collect_empty_input() {
    let config = jobs(2);
    let store = collect(&[], &FakeExtractor::new(), &config).unwrap();
    assert!(store.is_empty());
}

#[test]
fn collect_extraction_failure_cancels() {
    let config = jobs(1);
    let paths: Vec<PathBuf> = ["bad", "ok1", "ok2", "ok3"].iter().map(PathBuf::from).collect();
    let extractor = FakeExtractor::new();

    let err = collect(&paths, &extractor, &config).unwrap_err();
    assert!(matches!(err, CollectError::Extraction(_)));
    assert_eq!(err.exit_code(), 1);
    let msg = err.to_string();
    assert!(msg.contains("while processing bad"), "{msg}");
    assert!(msg.contains("corrupt data file"), "{msg}");
    // the single worker stops after the failing file
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn collect_reports_merge_errors() {
    let dir = common::tempdir();
    let a = common::write_tracefile(
        dir.path(),
        "a.json",
        vec![common::with_function(FileCoverage::new("/proj/src/f.c"), "foo", 3, 1)],
    );
    let b = common::write_tracefile(
        dir.path(),
        "b.json",
        vec![common::with_function(FileCoverage::new("/proj/src/f.c"), "foo", 5, 1)],
    );
    let paths = vec![a, b];

    let config = jobs(2);
    let err = collect(&paths, &JsonTracefileExtractor::new(&config), &config).unwrap_err();
    let CollectError::Merge(errs) = &err else {
        panic!("expected merge errors, got {err}");
    };
    assert_eq!(errs.len(), 1);
    assert_eq!(err.exit_code(), 64);
    assert!(err.to_string().contains("3, 5"), "{err}");

    let config = jobs(2).with_merge_mode(MergeMode::MergeUseLineMax);
    let store = collect(&paths, &JsonTracefileExtractor::new(&config), &config).unwrap();
    let func = store.get("/proj/src/f.c").unwrap().functions.get("foo").unwrap();
    assert_eq!(func.lines().collect::<Vec<_>>(), vec![5]);
}

#[test]
fn collect_missing_tracefile() {
    let dir = common::tempdir();
    let paths = vec![dir.path().join("missing.json")];
    let config = jobs(1);
    let err = collect(&paths, &JsonTracefileExtractor::new(&config), &config).unwrap_err();
    assert!(err.to_string().contains("missing.json"), "{err}");
}

#[test]
fn ingest_single_tracefile() {
    let dir = common::tempdir();
    let path = common::write_tracefile(
        dir.path(),
        "one.json",
        vec![
            common::file_with_lines("/proj/a.c", &[(1, 1)]),
            common::file_with_lines("/proj/lib/b.c", &[(1, 0), (2, 0)]),
        ],
    );
    let config = common::config();

    let mut store = CoverageStore::new(config.merge_options());
    ingest_tracefile(&mut store, &path, &config).unwrap();
    ingest_tracefile(&mut store, &path, &config).unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.summary().line, CoverageStat::new(1, 3));
    let a = store.get("/proj/a.c").unwrap();
    assert_eq!(a.lines.values().next().unwrap().count, 2);
    assert!(a.data_sources.contains(&path.display().to_string()));
}

#[test]
fn ingest_rejects_other_format_version() {
    let dir = common::tempdir();
    let path = dir.path().join("old.json");
    std::fs::write(&path, r#"{"gcovr/format_version": "0.5", "files": []}"#).unwrap();

    let config = common::config();
    let mut store = CoverageStore::default();
    let err = ingest_tracefile(&mut store, &path, &config).unwrap_err();
    assert!(format!("{err:#}").contains("0.5"), "{err:#}");
    assert!(store.is_empty());
}

#[cfg(unix)]
#[test]
fn command_extractor_runs_program() {
    use covmerge::ingest::CommandExtractor;

    let dir = common::tempdir();
    let path = common::write_tracefile(
        dir.path(),
        "cmd.json",
        vec![common::file_with_lines("/proj/c.c", &[(9, 3)])],
    );
    let config = jobs(1);

    let extractor = CommandExtractor::new("cat", ["{}"], &config);
    let store = collect(&[path], &extractor, &config).unwrap();
    assert_eq!(store.get("/proj/c.c").unwrap().lines.values().next().unwrap().count, 3);

    let failing = CommandExtractor::new("false", Vec::<String>::new(), &config);
    let err = collect(&[dir.path().join("x")], &failing, &config).unwrap_err();
    assert!(matches!(err, CollectError::Extraction(_)));
}
