//! Aggregate statistics over the merged tree and sort-for-display.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{FileCoverage, FunctionCoverage, LineCoverage};
use crate::stats::{CoverageStat, DecisionCoverageStat, SummarizedStats};
use crate::store::CoverageStore;

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// Line coverage of a single line record.
#[must_use]
pub fn line_stat(line: &LineCoverage) -> CoverageStat {
    if line.is_reportable() {
        CoverageStat::new(u64::from(line.is_covered()), 1)
    } else {
        CoverageStat::default()
    }
}

#[must_use]
pub fn branch_stat(line: &LineCoverage) -> CoverageStat {
    line.branches
        .values()
        .filter(|b| b.is_reportable())
        .fold(CoverageStat::default(), |acc, b| {
            acc + CoverageStat::new(u64::from(b.is_covered()), 1)
        })
}

#[must_use]
pub fn condition_stat(line: &LineCoverage) -> CoverageStat {
    line.conditions
        .values()
        .filter(|c| c.is_reportable())
        .fold(CoverageStat::default(), |acc, c| {
            acc + CoverageStat::new(u64::from(c.covered), u64::from(c.count))
        })
}

#[must_use]
pub fn decision_stat(line: &LineCoverage) -> DecisionCoverageStat {
    line.decision
        .map(|d| d.coverage())
        .unwrap_or_default()
}

#[must_use]
pub fn call_stat(line: &LineCoverage) -> CoverageStat {
    line.calls
        .values()
        .filter(|c| c.is_reportable())
        .fold(CoverageStat::default(), |acc, c| {
            acc + CoverageStat::new(u64::from(c.is_covered()), 1)
        })
}

/// One unit per non-excluded definition line.
#[must_use]
pub fn function_stat(function: &FunctionCoverage) -> CoverageStat {
    function
        .excluded
        .iter()
        .filter(|(_, &excluded)| !excluded)
        .fold(CoverageStat::default(), |acc, (lineno, _)| {
            let called = function.count.get(lineno).is_some_and(|&c| c > 0);
            acc + CoverageStat::new(u64::from(called), 1)
        })
}

impl SummarizedStats {
    /// Fold every line and function of `file` exactly once. Lines that are
    /// excluded or carry no code contribute nothing.
    #[must_use]
    pub fn from_file(file: &FileCoverage) -> Self {
        let mut stats = SummarizedStats::default();
        for line in file.lines.values().filter(|l| l.is_reportable()) {
            stats.line += line_stat(line);
            stats.branch += branch_stat(line);
            stats.condition += condition_stat(line);
            stats.decision += decision_stat(line);
            stats.call += call_stat(line);
        }
        for function in file.functions.values() {
            stats.function += function_stat(function);
        }
        stats
    }

    #[must_use]
    pub fn from_store(store: &CoverageStore) -> Self {
        store
            .files()
            .map(SummarizedStats::from_file)
            .fold(SummarizedStats::default(), |acc, s| acc + s)
    }
}

/// What to order report rows by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortKey {
    #[default]
    Filename,
    UncoveredNumber,
    UncoveredPercent,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filename" => Ok(SortKey::Filename),
            "uncovered-number" => Ok(SortKey::UncoveredNumber),
            "uncovered-percent" => Ok(SortKey::UncoveredPercent),
            _ => Err(format!(
                "Unknown sort key: '{s}'. Supported: filename, uncovered-number, uncovered-percent"
            )),
        }
    }
}

/// Which metric the uncovered-* sort keys look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMetric {
    #[default]
    Line,
    Branch,
    Condition,
    Decision,
    Function,
    Call,
}

impl SortMetric {
    #[must_use]
    pub fn select(&self, stats: &SummarizedStats) -> CoverageStat {
        match self {
            SortMetric::Line => stats.line,
            SortMetric::Branch => stats.branch,
            SortMetric::Condition => stats.condition,
            SortMetric::Decision => stats.decision.to_coverage_stat(),
            SortMetric::Function => stats.function,
            SortMetric::Call => stats.call,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortMetric::Line => "line",
            SortMetric::Branch => "branch",
            SortMetric::Condition => "condition",
            SortMetric::Decision => "decision",
            SortMetric::Function => "function",
            SortMetric::Call => "call",
        }
    }
}

impl FromStr for SortMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            SortMetric::Line,
            SortMetric::Branch,
            SortMetric::Condition,
            SortMetric::Decision,
            SortMetric::Function,
            SortMetric::Call,
        ]
        .into_iter()
        .find(|m| m.as_str() == s)
        .ok_or_else(|| format!("Unknown sort metric: '{s}'"))
    }
}

impl fmt::Display for SortMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Segment of a natural sort key: digit runs compare numerically.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NaturalPart {
    Text(String),
    Number(String),
}

impl Ord for NaturalPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (NaturalPart::Number(a), NaturalPart::Number(b)) => {
                let (a, b) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (NaturalPart::Text(a), NaturalPart::Text(b)) => a.cmp(b),
            (NaturalPart::Number(_), NaturalPart::Text(_)) => Ordering::Less,
            (NaturalPart::Text(_), NaturalPart::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for NaturalPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Case-folded key where `file10` sorts after `file9`.
fn natural_key(path: &str) -> Vec<NaturalPart> {
    let folded = path.to_lowercase();
    let mut parts = Vec::new();
    let mut last = 0;
    for m in DIGITS_RE.find_iter(&folded) {
        parts.push(NaturalPart::Text(folded[last..m.start()].to_string()));
        parts.push(NaturalPart::Number(m.as_str().to_string()));
        last = m.end();
    }
    parts.push(NaturalPart::Text(folded[last..].to_string()));
    parts
}

/// Order `(path, stats)` entries for display and return the paths.
///
/// Metric keys sort ascending by uncovered count or covered ratio (descending
/// when `reverse`); ties fall back to ascending path order. Entries with
/// nothing to cover count as 110% covered under [`SortKey::UncoveredPercent`].
pub fn sort_paths<'a, I>(entries: I, key: SortKey, metric: SortMetric, reverse: bool) -> Vec<&'a str>
where
    I: IntoIterator<Item = (&'a str, SummarizedStats)>,
{
    let mut rows: Vec<(&'a str, CoverageStat)> = entries
        .into_iter()
        .map(|(path, stats)| (path, metric.select(&stats)))
        .collect();

    match key {
        SortKey::Filename => {
            rows.sort_by_cached_key(|(path, _)| natural_key(path));
            if reverse {
                rows.reverse();
            }
        }
        SortKey::UncoveredNumber => rows.sort_by(|(pa, a), (pb, b)| {
            let ord = a.uncovered().cmp(&b.uncovered());
            let ord = if reverse { ord.reverse() } else { ord };
            ord.then_with(|| pa.cmp(pb))
        }),
        SortKey::UncoveredPercent => rows.sort_by(|(pa, a), (pb, b)| {
            let ord = a.ratio_or(1.1).total_cmp(&b.ratio_or(1.1));
            let ord = if reverse { ord.reverse() } else { ord };
            ord.then_with(|| pa.cmp(pb))
        }),
    }

    rows.into_iter().map(|(path, _)| path).collect()
}
