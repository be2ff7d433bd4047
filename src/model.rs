//! In-memory coverage model. Upstream parsers build these entities, the
//! store merges them across runs, and the summary/render layers read them.
//!
//! Every entity is identified by a key. Inserting an entity whose key is
//! already present merges the two observations instead of replacing one.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::{MergeError, Result};
use crate::merge::{Merge, MergeOptions};
use crate::stats::DecisionCoverageStat;

/// Identity of a branch within a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchKey {
    pub branchno: Option<u32>,
    pub source_block_id: Option<u32>,
}

/// One outgoing edge of a basic block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchCoverage {
    pub branchno: Option<u32>,
    pub source_block_id: Option<u32>,
    /// How often the edge was taken.
    pub count: u64,
    pub fallthrough: bool,
    pub throw: bool,
    pub destination_block_id: Option<u32>,
    pub excluded: bool,
}

impl BranchCoverage {
    #[must_use]
    pub fn new(branchno: u32, count: u64) -> Self {
        Self {
            branchno: Some(branchno),
            count,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn key(&self) -> BranchKey {
        BranchKey {
            branchno: self.branchno,
            source_block_id: self.source_block_id,
        }
    }

    pub(crate) fn location(&self) -> String {
        let mut info = Vec::new();
        if let Some(branchno) = self.branchno {
            info.push(format!("branch {branchno}"));
        }
        if let Some(block) = self.source_block_id {
            info.push(format!("source block {block}"));
        }
        info.join(", ")
    }

    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !self.excluded
    }

    #[must_use]
    pub fn is_covered(&self) -> bool {
        self.is_reportable() && self.count > 0
    }
}

/// MC/DC style coverage of one boolean expression on a line.
///
/// `count` is the number of outcome slots (two per condition). The
/// `not_covered_*` sets hold the indices of conditions that were never
/// observed evaluating to true/false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionCoverage {
    pub conditionno: u32,
    pub count: u32,
    pub covered: u32,
    pub not_covered_true: BTreeSet<u32>,
    pub not_covered_false: BTreeSet<u32>,
    pub excluded: bool,
}

impl ConditionCoverage {
    pub fn new(
        conditionno: u32,
        count: u32,
        covered: u32,
        not_covered_true: impl IntoIterator<Item = u32>,
        not_covered_false: impl IntoIterator<Item = u32>,
    ) -> Result<Self> {
        let cond = Self {
            conditionno,
            count,
            covered,
            not_covered_true: not_covered_true.into_iter().collect(),
            not_covered_false: not_covered_false.into_iter().collect(),
            excluded: false,
        };
        cond.validate()?;
        Ok(cond)
    }

    pub(crate) fn location(&self) -> String {
        format!("condition {}", self.conditionno)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MergeError::invalid(self.location(), msg));
        if self.count % 2 != 0 {
            return invalid(format!("count must be even, got {}.", self.count));
        }
        if self.covered > self.count {
            return invalid("count must not be less than covered.".to_string());
        }
        let uncovered = self.not_covered_true.len() + self.not_covered_false.len();
        if self.count as usize != self.covered as usize + uncovered {
            return invalid(format!(
                "The sum of the covered conditions ({}), the uncovered true conditions ({}) \
                 and the uncovered false conditions ({}) must be equal to the count of conditions ({}).",
                self.covered,
                self.not_covered_true.len(),
                self.not_covered_false.len(),
                self.count
            ));
        }
        let limit = self.count / 2;
        if let Some(idx) = self
            .not_covered_true
            .iter()
            .chain(&self.not_covered_false)
            .find(|&&idx| idx >= limit)
        {
            return invalid(format!("condition index {idx} out of range (< {limit})."));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !self.excluded
    }

    #[must_use]
    pub fn is_covered(&self) -> bool {
        self.is_reportable() && self.covered > 0
    }

    #[must_use]
    pub fn is_fully_covered(&self) -> bool {
        self.is_reportable() && self.covered == self.count
    }
}

/// A function call made from a line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallCoverage {
    pub callno: u32,
    pub source_block_id: Option<u32>,
    /// How often the call returned.
    pub returned: u64,
    pub excluded: bool,
}

impl CallCoverage {
    #[must_use]
    pub fn new(callno: u32, returned: u64) -> Self {
        Self {
            callno,
            returned,
            ..Default::default()
        }
    }

    pub(crate) fn location(&self) -> String {
        format!("call {}", self.callno)
    }

    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !self.excluded
    }

    #[must_use]
    pub fn is_covered(&self) -> bool {
        self.is_reportable() && self.returned > 0
    }
}

/// Outcome coverage of the control-flow decision on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionCoverage {
    /// There is a decision but it could not be analyzed.
    Uncheckable,
    Conditional { count_true: u64, count_false: u64 },
    Switch { count: u64 },
}

impl DecisionCoverage {
    /// Build a conditional decision from reconstructed counts. Reconstruction
    /// across multi-line statements can produce negative values; those
    /// degrade to [`DecisionCoverage::Uncheckable`].
    #[must_use]
    pub fn conditional_from_delta(count_true: i64, count_false: i64) -> Self {
        match (u64::try_from(count_true), u64::try_from(count_false)) {
            (Ok(count_true), Ok(count_false)) => DecisionCoverage::Conditional {
                count_true,
                count_false,
            },
            _ => {
                warn!(
                    count_true,
                    count_false, "negative decision count, treating decision as uncheckable"
                );
                DecisionCoverage::Uncheckable
            }
        }
    }

    #[must_use]
    pub fn switch_from_delta(count: i64) -> Self {
        match u64::try_from(count) {
            Ok(count) => DecisionCoverage::Switch { count },
            Err(_) => {
                warn!(count, "negative switch count, treating decision as uncheckable");
                DecisionCoverage::Uncheckable
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionCoverage::Uncheckable => "uncheckable",
            DecisionCoverage::Conditional { .. } => "conditional",
            DecisionCoverage::Switch { .. } => "switch",
        }
    }

    #[must_use]
    pub fn is_covered(&self) -> bool {
        match *self {
            DecisionCoverage::Uncheckable => true,
            DecisionCoverage::Conditional {
                count_true,
                count_false,
            } => count_true > 0 && count_false > 0,
            DecisionCoverage::Switch { count } => count > 0,
        }
    }

    #[must_use]
    pub fn coverage(&self) -> DecisionCoverageStat {
        match *self {
            DecisionCoverage::Uncheckable => DecisionCoverageStat {
                covered: 0,
                uncheckable: 1,
                total: 2,
            },
            DecisionCoverage::Conditional {
                count_true,
                count_false,
            } => DecisionCoverageStat {
                covered: u64::from(count_true > 0) + u64::from(count_false > 0),
                uncheckable: 0,
                total: 2,
            },
            DecisionCoverage::Switch { count } => DecisionCoverageStat {
                covered: u64::from(count > 0),
                uncheckable: 0,
                total: 1,
            },
        }
    }
}

/// Identity of a line record. Several functions (template instantiations,
/// overloads) may share one physical line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineKey {
    pub lineno: u32,
    pub function_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineCoverage {
    pub lineno: u32,
    pub function_name: Option<String>,
    /// How often the line was executed at least partially.
    pub count: u64,
    /// Line carries no executable code.
    pub noncode: bool,
    pub excluded: bool,
    /// Checksum of the source text, used to detect changed sources.
    pub md5: Option<String>,
    pub block_ids: Option<BTreeSet<u32>>,
    pub decision: Option<DecisionCoverage>,
    pub branches: BTreeMap<BranchKey, BranchCoverage>,
    pub conditions: BTreeMap<u32, ConditionCoverage>,
    pub calls: BTreeMap<u32, CallCoverage>,
}

impl LineCoverage {
    pub fn new(lineno: u32, function_name: Option<&str>, count: u64) -> Result<Self> {
        if lineno == 0 {
            return Err(MergeError::invalid(
                "0",
                "lineno must be a positive value.",
            ));
        }
        Ok(Self {
            lineno,
            function_name: function_name.map(str::to_owned),
            count,
            ..Default::default()
        })
    }

    #[must_use]
    pub fn key(&self) -> LineKey {
        LineKey {
            lineno: self.lineno,
            function_name: self.function_name.clone(),
        }
    }

    pub(crate) fn location(&self) -> String {
        self.lineno.to_string()
    }

    /// Add a branch, merging with an existing branch of the same key.
    pub fn insert_branch(&mut self, branch: BranchCoverage) -> Result<()> {
        let location = self.location();
        insert_or_merge(
            &mut self.branches,
            branch.key(),
            branch,
            &MergeOptions::default(),
        )
        .map_err(|e| e.within(&location))
    }

    pub fn insert_condition(&mut self, condition: ConditionCoverage) -> Result<()> {
        let location = self.location();
        insert_or_merge(
            &mut self.conditions,
            condition.conditionno,
            condition,
            &MergeOptions::default(),
        )
        .map_err(|e| e.within(&location))
    }

    pub fn insert_call(&mut self, call: CallCoverage) -> Result<()> {
        let location = self.location();
        insert_or_merge(&mut self.calls, call.callno, call, &MergeOptions::default())
            .map_err(|e| e.within(&location))
    }

    pub fn insert_decision(&mut self, decision: DecisionCoverage) -> Result<()> {
        match self.decision.as_mut() {
            Some(existing) => existing
                .merge(decision, &MergeOptions::default())
                .map_err(|e| e.within(&self.lineno.to_string())),
            None => {
                self.decision = Some(decision);
                Ok(())
            }
        }
    }

    /// Mark the line and everything on it as excluded from statistics.
    pub fn exclude(&mut self) {
        self.excluded = true;
        for branch in self.branches.values_mut() {
            branch.excluded = true;
        }
        for condition in self.conditions.values_mut() {
            condition.excluded = true;
        }
        for call in self.calls.values_mut() {
            call.excluded = true;
        }
        self.decision = None;
    }

    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !self.excluded && !self.noncode
    }

    #[must_use]
    pub fn is_covered(&self) -> bool {
        self.is_reportable() && self.count > 0
    }

    #[must_use]
    pub fn is_uncovered(&self) -> bool {
        self.is_reportable() && self.count == 0
    }

    #[must_use]
    pub fn has_uncovered_branch(&self) -> bool {
        !self
            .branches
            .values()
            .all(|b| b.is_covered() || !b.is_reportable())
    }

    #[must_use]
    pub fn has_uncovered_decision(&self) -> bool {
        self.decision.is_some_and(|d| !d.is_covered())
    }
}

/// Coverage of one function, possibly observed on several definition lines.
///
/// The per-line maps exist so that the different merge modes can either
/// fold or keep apart observations that disagree on the definition line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionCoverage {
    pub mangled_name: Option<String>,
    pub demangled_name: Option<String>,
    pub count: BTreeMap<u32, u64>,
    pub blocks_percent: BTreeMap<u32, f64>,
    pub excluded: BTreeMap<u32, bool>,
    pub start: Option<BTreeMap<u32, (u32, u32)>>,
    pub end: Option<BTreeMap<u32, (u32, u32)>>,
}

impl FunctionCoverage {
    /// A mangled name containing `(` is really a demangled name and is moved
    /// to that slot; in that case no separate demangled name may be given.
    pub fn new(
        mangled_name: Option<&str>,
        demangled_name: Option<&str>,
        lineno: u32,
        count: u64,
        blocks_percent: f64,
    ) -> Result<Self> {
        let (mangled_name, demangled_name) = match mangled_name {
            Some(m) if m.contains('(') => {
                if demangled_name.is_some() {
                    return Err(MergeError::invalid(
                        lineno.to_string(),
                        format!("Got {m} as 'mangled_name', in this case 'demangled_name' must be None."),
                    ));
                }
                (None, Some(m))
            }
            m => (m, demangled_name),
        };
        if mangled_name.is_none() && demangled_name.is_none() {
            return Err(MergeError::invalid(
                lineno.to_string(),
                "function needs a mangled or demangled name.",
            ));
        }
        if !(0.0..=100.0).contains(&blocks_percent) {
            return Err(MergeError::invalid(
                lineno.to_string(),
                format!("blocks_percent must be within 0..=100, got {blocks_percent}."),
            ));
        }
        Ok(Self {
            mangled_name: mangled_name.map(str::to_owned),
            demangled_name: demangled_name.map(str::to_owned),
            count: BTreeMap::from([(lineno, count)]),
            blocks_percent: BTreeMap::from([(lineno, blocks_percent)]),
            excluded: BTreeMap::from([(lineno, false)]),
            start: None,
            end: None,
        })
    }

    /// Attach `(line, column)` start and end positions to every definition line.
    #[must_use]
    pub fn with_position(mut self, start: (u32, u32), end: (u32, u32)) -> Self {
        self.start = Some(self.count.keys().map(|&l| (l, start)).collect());
        self.end = Some(self.count.keys().map(|&l| (l, end)).collect());
        self
    }

    #[must_use]
    pub fn with_excluded(mut self, excluded: bool) -> Self {
        for flag in self.excluded.values_mut() {
            *flag = excluded;
        }
        self
    }

    /// Demangled name if present, else the mangled name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.demangled_name
            .as_deref()
            .or(self.mangled_name.as_deref())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn key(&self, policy: crate::merge::FunctionKeyPolicy) -> String {
        use crate::merge::FunctionKeyPolicy;
        match policy {
            FunctionKeyPolicy::PreferDemangled => self.name().to_string(),
            FunctionKeyPolicy::Mangled => self
                .mangled_name
                .as_deref()
                .or(self.demangled_name.as_deref())
                .unwrap_or_default()
                .to_string(),
        }
    }

    #[must_use]
    pub fn is_function(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| {
            self.mangled_name.as_deref() == Some(n) || self.demangled_name.as_deref() == Some(n)
        })
    }

    /// Definition lines in ascending order.
    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        self.count.keys().copied()
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.lines().next().unwrap_or_default()
    }

    /// e.g. `"3"` or `"3 (5, 7)"` for a function seen on several lines.
    pub(crate) fn location(&self) -> String {
        let mut lines = self.lines().map(|l| l.to_string());
        let first = lines.next().unwrap_or_default();
        let rest: Vec<String> = lines.collect();
        if rest.is_empty() {
            first
        } else {
            format!("{first} ({})", rest.join(", "))
        }
    }
}

/// All coverage data for one source file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileCoverage {
    /// Absolute, normalized path; the store key.
    pub filename: String,
    pub lines: BTreeMap<LineKey, LineCoverage>,
    /// Keyed by [`FunctionCoverage::key`] under the active key policy.
    pub functions: BTreeMap<String, FunctionCoverage>,
    /// Tracefiles that contributed to this entry.
    pub data_sources: BTreeSet<String>,
}

impl FileCoverage {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.data_sources.insert(source.into());
        self
    }

    /// Add a line, merging with an existing record for the same
    /// `(lineno, function)` key. Returns the stored record.
    pub fn insert_line(
        &mut self,
        line: LineCoverage,
        options: &MergeOptions,
    ) -> Result<&mut LineCoverage> {
        let filename = &self.filename;
        match self.lines.entry(line.key()) {
            Entry::Occupied(e) => {
                let existing = e.into_mut();
                existing
                    .merge(line, options)
                    .map_err(|err| err.in_file(filename))?;
                Ok(existing)
            }
            Entry::Vacant(e) => Ok(e.insert(line)),
        }
    }

    pub fn insert_function(
        &mut self,
        function: FunctionCoverage,
        options: &MergeOptions,
    ) -> Result<()> {
        let key = function.key(options.function_key);
        insert_or_merge(&mut self.functions, key, function, options)
            .map_err(|err| err.in_file(&self.filename))
    }

    /// All records (one per function) on a physical line.
    pub fn line_records(&self, lineno: u32) -> impl Iterator<Item = &LineCoverage> {
        let from = LineKey {
            lineno,
            function_name: None,
        };
        self.lines
            .range(from..)
            .take_while(move |(k, _)| k.lineno == lineno)
            .map(|(_, v)| v)
    }

    /// Distinct physical line numbers in ascending order.
    pub fn line_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        let mut last = None;
        self.lines.keys().filter_map(move |k| {
            if last == Some(k.lineno) {
                None
            } else {
                last = Some(k.lineno);
                Some(k.lineno)
            }
        })
    }

    /// Functions sorted by their lowest definition line, then name.
    #[must_use]
    pub fn functions_by_line(&self) -> Vec<&FunctionCoverage> {
        let mut funcs: Vec<&FunctionCoverage> = self.functions.values().collect();
        funcs.sort_by(|a, b| {
            a.first_line()
                .cmp(&b.first_line())
                .then_with(|| a.name().cmp(b.name()))
        });
        funcs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.functions.is_empty()
    }
}

pub(crate) fn insert_or_merge<K: Ord, V: Merge>(
    map: &mut BTreeMap<K, V>,
    key: K,
    item: V,
    options: &MergeOptions,
) -> Result<()> {
    match map.entry(key) {
        Entry::Occupied(mut e) => e.get_mut().merge(item, options),
        Entry::Vacant(e) => {
            e.insert(item);
            Ok(())
        }
    }
}
