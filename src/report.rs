//! Summary report formatting over a merged store.

use std::fmt::Write;

use crate::config::Config;
use crate::model::FileCoverage;
use crate::stats::{CoverageStat, SummarizedStats};
use crate::store::CoverageStore;

/// One report row.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    /// Path as presented (relative to the root when below it).
    pub path: String,
    pub stats: SummarizedStats,
    /// Physical lines with code that no run executed.
    pub missed_lines: Vec<u32>,
    /// Physical lines with at least one reportable record.
    pub reportable_lines: Vec<u32>,
}

impl FileReport {
    #[must_use]
    pub fn from_file(file: &FileCoverage, config: &Config) -> Self {
        let mut missed_lines = Vec::new();
        let mut reportable_lines = Vec::new();
        for lineno in file.line_numbers() {
            let mut reportable = false;
            let mut covered = false;
            for line in file.line_records(lineno) {
                reportable |= line.is_reportable();
                covered |= line.is_covered();
            }
            if reportable {
                reportable_lines.push(lineno);
                if !covered {
                    missed_lines.push(lineno);
                }
            }
        }
        Self {
            path: config.presentable_filename(&file.filename),
            stats: SummarizedStats::from_file(file),
            missed_lines,
            reportable_lines,
        }
    }

    #[must_use]
    pub fn missing(&self) -> String {
        format_missed_ranges(&self.missed_lines, &self.reportable_lines)
    }
}

/// Aggregated coverage data, ready to be formatted.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    /// Rows in display order.
    pub files: Vec<FileReport>,
    pub total: SummarizedStats,
    pub show_decision: bool,
}

impl CoverageReport {
    /// Rows are ordered by the configured sort key and metric.
    #[must_use]
    pub fn build(store: &CoverageStore, config: &Config) -> Self {
        let files = store
            .sorted_filenames(config.sort_key, config.sort_metric, config.sort_reverse)
            .into_iter()
            .filter_map(|name| store.get(name))
            .map(|file| FileReport::from_file(file, config))
            .collect();
        Self {
            files,
            total: store.summary(),
            show_decision: config.show_decision,
        }
    }

    /// Format using a specific formatter.
    #[must_use]
    pub fn format(&self, formatter: &dyn ReportFormatter) -> String {
        formatter.format(self)
    }
}

/// Trait for formatting coverage reports.
pub trait ReportFormatter {
    /// Format the report to a string.
    fn format(&self, report: &CoverageReport) -> String;
}

fn percent(stat: &CoverageStat) -> String {
    match stat.percent() {
        Some(pct) => format!("{pct:.1}%"),
        None => "--".to_string(),
    }
}

/// Plain text formatter.
pub struct TextFormatter;

const RULE_WIDTH: usize = 78;

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &CoverageReport) -> String {
        let mut out = String::new();

        if report.files.is_empty() {
            out.push_str("No coverage data.\n");
            return out;
        }

        let width = report
            .files
            .iter()
            .map(|f| f.path.len())
            .max()
            .unwrap_or(0)
            .max("TOTAL".len());
        let rule = "-".repeat(RULE_WIDTH.max(width + 40));

        writeln!(out, "{rule}").unwrap();
        writeln!(
            out,
            "{:<width$} {:>8} {:>8} {:>7}   Missing",
            "File", "Lines", "Exec", "Cover"
        )
        .unwrap();
        writeln!(out, "{rule}").unwrap();

        for f in &report.files {
            let line = f.stats.line;
            let path = &f.path;
            writeln!(
                out,
                "{path:<width$} {:>8} {:>8} {:>7}   {}",
                line.total,
                line.covered,
                percent(&line),
                f.missing()
            )
            .unwrap();
        }

        let total = report.total;
        writeln!(out, "{rule}").unwrap();
        writeln!(
            out,
            "{:<width$} {:>8} {:>8} {:>7}",
            "TOTAL",
            total.line.total,
            total.line.covered,
            percent(&total.line)
        )
        .unwrap();
        writeln!(out, "{rule}").unwrap();

        let branch = total.branch;
        writeln!(
            out,
            "Branch coverage: {} ({}/{})",
            percent(&branch),
            branch.covered,
            branch.total
        )
        .unwrap();
        let function = total.function;
        writeln!(
            out,
            "Function coverage: {} ({}/{})",
            percent(&function),
            function.covered,
            function.total
        )
        .unwrap();
        if report.show_decision {
            let decision = total.decision;
            writeln!(
                out,
                "Decision coverage: {} ({}/{}, {} uncheckable)",
                percent(&decision.to_coverage_stat()),
                decision.covered,
                decision.total,
                decision.uncheckable
            )
            .unwrap();
        }

        out
    }
}

/// Markdown formatter.
pub struct MarkdownFormatter;

impl ReportFormatter for MarkdownFormatter {
    fn format(&self, report: &CoverageReport) -> String {
        let mut md = String::new();
        let total = report.total;

        writeln!(md, "### Line Coverage: {}\n", percent(&total.line)).unwrap();
        writeln!(
            md,
            "**{}** of **{}** lines covered, **{}** of **{}** branches taken",
            total.line.covered, total.line.total, total.branch.covered, total.branch.total
        )
        .unwrap();

        let with_misses: Vec<&FileReport> = report
            .files
            .iter()
            .filter(|f| !f.missed_lines.is_empty())
            .collect();

        if report.files.is_empty() {
            md.push_str("\nNo coverage data.\n");
            return md;
        }

        if report.show_decision {
            md.push_str("\n| File | Lines | Branches | Decisions |\n");
            md.push_str("|:-----|------:|---------:|----------:|\n");
        } else {
            md.push_str("\n| File | Lines | Branches |\n");
            md.push_str("|:-----|------:|---------:|\n");
        }
        for f in &report.files {
            let path = &f.path;
            write!(
                md,
                "| `{path}` | {} | {} |",
                percent(&f.stats.line),
                percent(&f.stats.branch)
            )
            .unwrap();
            if report.show_decision {
                write!(md, " {} |", percent(&f.stats.decision.to_coverage_stat())).unwrap();
            }
            md.push('\n');
        }

        if with_misses.is_empty() {
            md.push_str("\nAll lines are covered! 🎉\n");
        } else {
            md.push_str("\n<details>\n<summary>Missed lines</summary>\n\n");
            for f in &with_misses {
                let path = &f.path;
                writeln!(md, "**`{path}`**: {}\n", f.missing()).unwrap();
            }
            md.push_str("</details>\n");
        }

        md
    }
}

/// Widest run of record-less lines that may sit inside one missed range.
const MAX_SKIPPED_LINES: u32 = 2;

/// Group missed line numbers into `(first, last)` ranges for the `Missing`
/// column. Two missed lines share a range when every line between them has
/// no reportable record and there are at most [`MAX_SKIPPED_LINES`] of them,
/// so blank lines and comments do not split a block of dead code.
///
/// `missed` and `reportable` are ascending without duplicates.
#[must_use]
pub fn missed_ranges(missed: &[u32], reportable: &[u32]) -> Vec<(u32, u32)> {
    debug_assert!(
        missed.windows(2).all(|w| w[0] < w[1]),
        "missed lines must be ascending"
    );

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &lineno in missed {
        match ranges.last_mut() {
            Some((_, last))
                if lineno - *last - 1 <= MAX_SKIPPED_LINES
                    && (*last + 1..lineno).all(|l| reportable.binary_search(&l).is_err()) =>
            {
                *last = lineno;
            }
            _ => ranges.push((lineno, lineno)),
        }
    }
    ranges
}

/// `2, 5-7, 12`: missed ranges as shown in the `Missing` column.
#[must_use]
pub fn format_missed_ranges(missed: &[u32], reportable: &[u32]) -> String {
    missed_ranges(missed, reportable)
        .into_iter()
        .map(|(first, last)| {
            if first == last {
                first.to_string()
            } else {
                format!("{first}-{last}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
