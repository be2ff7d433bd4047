//! Aggregate coverage counters. Every summary and directory rollup is built
//! from these value types.

use std::ops::{Add, AddAssign};

use serde::Serialize;

/// A single coverage metric, e.g. the line coverage of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CoverageStat {
    pub covered: u64,
    pub total: u64,
}

impl CoverageStat {
    #[must_use]
    pub fn new(covered: u64, total: u64) -> Self {
        debug_assert!(covered <= total, "covered ({covered}) > total ({total})");
        Self { covered, total }
    }

    #[must_use]
    pub fn uncovered(&self) -> u64 {
        self.total - self.covered
    }

    /// Percentage of covered elements, `None` when there are no elements.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        // Only a fully covered entity reports 100%.
        if self.covered == self.total {
            return Some(100.0);
        }
        let ratio = self.covered as f64 / self.total as f64;
        Some(((ratio * 1000.0).round() / 10.0).min(99.9))
    }

    /// Like [`percent`](Self::percent), with `default` standing in for "n/a".
    #[must_use]
    pub fn percent_or(&self, default: f64) -> f64 {
        self.percent().unwrap_or(default)
    }

    /// Coverage ratio in `0.0..=1.0`, or `empty` when there is nothing to cover.
    #[must_use]
    pub fn ratio_or(&self, empty: f64) -> f64 {
        if self.total == 0 {
            empty
        } else {
            self.covered as f64 / self.total as f64
        }
    }
}

impl Add for CoverageStat {
    type Output = CoverageStat;

    fn add(self, rhs: CoverageStat) -> CoverageStat {
        CoverageStat {
            covered: self.covered + rhs.covered,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for CoverageStat {
    fn add_assign(&mut self, rhs: CoverageStat) {
        *self = *self + rhs;
    }
}

/// Decision coverage; uncheckable decisions count toward `total` but can
/// never be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DecisionCoverageStat {
    pub covered: u64,
    pub uncheckable: u64,
    pub total: u64,
}

impl DecisionCoverageStat {
    #[must_use]
    pub fn to_coverage_stat(self) -> CoverageStat {
        CoverageStat::new(self.covered, self.total)
    }

    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        self.to_coverage_stat().percent()
    }

    #[must_use]
    pub fn percent_or(&self, default: f64) -> f64 {
        self.to_coverage_stat().percent_or(default)
    }
}

impl Add for DecisionCoverageStat {
    type Output = DecisionCoverageStat;

    fn add(self, rhs: DecisionCoverageStat) -> DecisionCoverageStat {
        DecisionCoverageStat {
            covered: self.covered + rhs.covered,
            uncheckable: self.uncheckable + rhs.uncheckable,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for DecisionCoverageStat {
    fn add_assign(&mut self, rhs: DecisionCoverageStat) {
        *self = *self + rhs;
    }
}

/// All metrics of one file, directory or the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SummarizedStats {
    pub line: CoverageStat,
    pub branch: CoverageStat,
    pub condition: CoverageStat,
    pub decision: DecisionCoverageStat,
    pub function: CoverageStat,
    pub call: CoverageStat,
}

impl Add for SummarizedStats {
    type Output = SummarizedStats;

    fn add(mut self, rhs: SummarizedStats) -> SummarizedStats {
        self += rhs;
        self
    }
}

impl AddAssign for SummarizedStats {
    fn add_assign(&mut self, rhs: SummarizedStats) {
        self.line += rhs.line;
        self.branch += rhs.branch;
        self.condition += rhs.condition;
        self.decision += rhs.decision;
        self.function += rhs.function;
        self.call += rhs.call;
    }
}
