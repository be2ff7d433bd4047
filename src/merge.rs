//! Reconciliation of two observations of the same coverage entity.
//!
//! Every `merge` consumes the second observation. For well-formed inputs
//! without conflicting identities the operations are commutative and
//! associative: counters sum, flags combine with OR (or AND for `noncode`),
//! uncovered-outcome sets intersect.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MergeError, Result};
use crate::model::{
    insert_or_merge, BranchCoverage, CallCoverage, ConditionCoverage, DecisionCoverage,
    FileCoverage, FunctionCoverage, LineCoverage,
};

/// How to reconcile a function reported on different definition lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeMode {
    /// Fail with a merge error.
    #[default]
    #[serde(rename = "strict")]
    Strict,
    /// Fold everything into line 0.
    #[serde(rename = "merge-use-line-0")]
    MergeUseLine0,
    #[serde(rename = "merge-use-line-min")]
    MergeUseLineMin,
    #[serde(rename = "merge-use-line-max")]
    MergeUseLineMax,
    /// Keep one record per definition line.
    #[serde(rename = "separate")]
    Separate,
}

impl MergeMode {
    pub const ALL: [MergeMode; 5] = [
        MergeMode::Strict,
        MergeMode::MergeUseLine0,
        MergeMode::MergeUseLineMin,
        MergeMode::MergeUseLineMax,
        MergeMode::Separate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMode::Strict => "strict",
            MergeMode::MergeUseLine0 => "merge-use-line-0",
            MergeMode::MergeUseLineMin => "merge-use-line-min",
            MergeMode::MergeUseLineMax => "merge-use-line-max",
            MergeMode::Separate => "separate",
        }
    }
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        MergeMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                let supported: Vec<&str> = MergeMode::ALL.iter().map(MergeMode::as_str).collect();
                format!(
                    "Unknown merge mode: '{}'. Supported: {}",
                    s,
                    supported.join(", ")
                )
            })
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which function name identifies a function record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FunctionKeyPolicy {
    /// Demangled name when known, else the mangled name.
    #[default]
    PreferDemangled,
    /// Mangled name when known, else the demangled name.
    Mangled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOptions {
    pub mode: MergeMode,
    pub function_key: FunctionKeyPolicy,
}

impl MergeOptions {
    #[must_use]
    pub fn with_mode(mode: MergeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

/// Fold another observation of the same entity into `self`.
pub trait Merge: Sized {
    fn merge(&mut self, other: Self, options: &MergeOptions) -> Result<()>;
}

/// Merge two keyed collections: shared keys are merged, the rest inserted.
pub(crate) fn merge_map<K: Ord, V: Merge>(
    target: &mut BTreeMap<K, V>,
    other: BTreeMap<K, V>,
    options: &MergeOptions,
) -> Result<()> {
    for (key, item) in other {
        insert_or_merge(target, key, item, options)?;
    }
    Ok(())
}

/// Both sides must agree on a property when both define it.
fn merge_property<T: PartialEq + Clone + fmt::Display>(
    location: &str,
    what: &str,
    left: &Option<T>,
    right: &Option<T>,
) -> Result<Option<T>> {
    match (left, right) {
        (Some(l), Some(r)) if l != r => Err(MergeError::assertion(
            location,
            format!("{what} must be equal, got {l} and {r}."),
        )),
        _ => Ok(left.clone().or_else(|| right.clone())),
    }
}

/// First non-None value; a differing second value is tolerated.
fn first_some(location: &str, what: &str, left: Option<u32>, right: Option<u32>) -> Option<u32> {
    if let (Some(l), Some(r)) = (left, right) {
        if l != r {
            debug!(location, "{what} differs between runs ({l} vs {r}), keeping {l}");
        }
    }
    left.or(right)
}

impl Merge for BranchCoverage {
    fn merge(&mut self, other: Self, _options: &MergeOptions) -> Result<()> {
        self.count += other.count;
        self.fallthrough |= other.fallthrough;
        self.throw |= other.throw;
        self.excluded |= other.excluded;
        self.destination_block_id = first_some(
            &self.location(),
            "destination block",
            self.destination_block_id,
            other.destination_block_id,
        );
        Ok(())
    }
}

impl ConditionCoverage {
    fn check_mergeable(&self, other: &ConditionCoverage) -> Result<()> {
        if self.conditionno != other.conditionno {
            return Err(MergeError::conflict(
                self.location(),
                format!(
                    "The condition number must be equal, got {} and expected {}.",
                    other.conditionno, self.conditionno
                ),
            ));
        }
        if self.count != other.count {
            return Err(MergeError::conflict(
                self.location(),
                format!(
                    "The number of conditions must be equal, got {} and expected {}.",
                    other.count, self.count
                ),
            ));
        }
        Ok(())
    }
}

impl Merge for ConditionCoverage {
    fn merge(&mut self, other: Self, _options: &MergeOptions) -> Result<()> {
        self.check_mergeable(&other)?;
        // An outcome stays uncovered only if no run observed it.
        self.not_covered_true = self
            .not_covered_true
            .intersection(&other.not_covered_true)
            .copied()
            .collect();
        self.not_covered_false = self
            .not_covered_false
            .intersection(&other.not_covered_false)
            .copied()
            .collect();
        self.covered =
            self.count - (self.not_covered_true.len() + self.not_covered_false.len()) as u32;
        self.excluded |= other.excluded;
        Ok(())
    }
}

impl Merge for CallCoverage {
    fn merge(&mut self, other: Self, _options: &MergeOptions) -> Result<()> {
        self.returned += other.returned;
        self.excluded |= other.excluded;
        self.source_block_id = first_some(
            &self.location(),
            "source block",
            self.source_block_id,
            other.source_block_id,
        );
        Ok(())
    }
}

impl DecisionCoverage {
    fn check_mergeable(&self, other: &DecisionCoverage) -> Result<()> {
        if std::mem::discriminant(self) == std::mem::discriminant(other) {
            Ok(())
        } else {
            Err(MergeError::conflict(
                "",
                format!(
                    "decision type must be equal, got {} and {}.",
                    self.kind(),
                    other.kind()
                ),
            ))
        }
    }
}

impl Merge for DecisionCoverage {
    fn merge(&mut self, other: Self, _options: &MergeOptions) -> Result<()> {
        self.check_mergeable(&other)?;
        match (self, other) {
            (DecisionCoverage::Uncheckable, DecisionCoverage::Uncheckable) => {}
            (
                DecisionCoverage::Conditional {
                    count_true,
                    count_false,
                },
                DecisionCoverage::Conditional {
                    count_true: other_true,
                    count_false: other_false,
                },
            ) => {
                *count_true += other_true;
                *count_false += other_false;
            }
            (DecisionCoverage::Switch { count }, DecisionCoverage::Switch { count: other_count }) => {
                *count += other_count;
            }
            _ => unreachable!("variants checked above"),
        }
        Ok(())
    }
}

impl LineCoverage {
    /// Every way merging `other` into `self` can fail.
    fn check_mergeable(&self, other: &LineCoverage) -> Result<()> {
        let location = self.location();
        if self.lineno != other.lineno {
            return Err(MergeError::assertion(
                location,
                format!(
                    "Line number must be equal, got {} and {}.",
                    self.lineno, other.lineno
                ),
            ));
        }
        if self.function_name != other.function_name {
            return Err(MergeError::assertion(
                location,
                format!(
                    "Function name must be equal, got {:?} and {:?}.",
                    self.function_name, other.function_name
                ),
            ));
        }
        if let (Some(left), Some(right)) = (&self.md5, &other.md5) {
            if left != right {
                return Err(MergeError::SourceChanged {
                    location: location.clone(),
                    left: left.clone(),
                    right: right.clone(),
                });
            }
        }
        if let (Some(left), Some(right)) = (&self.decision, &other.decision) {
            left.check_mergeable(right)
                .map_err(|e| e.within(&location))?;
        }
        for (key, cond) in &other.conditions {
            if let Some(existing) = self.conditions.get(key) {
                existing
                    .check_mergeable(cond)
                    .map_err(|e| e.within(&location))?;
            }
        }
        Ok(())
    }
}

impl Merge for LineCoverage {
    fn merge(&mut self, other: Self, options: &MergeOptions) -> Result<()> {
        self.check_mergeable(&other)?;
        let location = self.location();

        self.count += other.count;
        self.noncode &= other.noncode;
        self.excluded |= other.excluded;
        if self.md5.is_none() {
            self.md5 = other.md5;
        }
        self.block_ids = match (self.block_ids.take(), other.block_ids) {
            (Some(mut left), Some(right)) => {
                left.extend(right);
                Some(left)
            }
            (left, right) => left.or(right),
        };
        if let Some(right) = other.decision {
            match self.decision.as_mut() {
                Some(left) => left.merge(right, options)?,
                None => self.decision = Some(right),
            }
        }
        merge_map(&mut self.branches, other.branches, options)
            .map_err(|e| e.within(&location))?;
        merge_map(&mut self.conditions, other.conditions, options)
            .map_err(|e| e.within(&location))?;
        merge_map(&mut self.calls, other.calls, options).map_err(|e| e.within(&location))?;
        Ok(())
    }
}

impl FunctionCoverage {
    fn check_mergeable(&self, other: &FunctionCoverage, options: &MergeOptions) -> Result<()> {
        let location = self.location();
        let demangled_name = merge_property(
            &location,
            "Function demangled name",
            &self.demangled_name,
            &other.demangled_name,
        )?;
        if demangled_name.is_none() {
            merge_property(
                &location,
                "Function mangled name",
                &self.mangled_name,
                &other.mangled_name,
            )?;
        }
        if options.mode == MergeMode::Strict && !self.count.keys().eq(other.count.keys()) {
            let lines: BTreeSet<u32> = self.lines().chain(other.lines()).collect();
            let lines: Vec<String> = lines.iter().map(u32::to_string).collect();
            return Err(MergeError::assertion(
                location,
                format!(
                    "Got function {} on multiple lines: {}.\n\
                     \tUse a merge mode other than '{}' to combine them.",
                    self.name(),
                    lines.join(", "),
                    MergeMode::Strict,
                ),
            ));
        }
        Ok(())
    }
}

impl Merge for FunctionCoverage {
    fn merge(&mut self, other: Self, options: &MergeOptions) -> Result<()> {
        self.check_mergeable(&other, options)?;
        let location = self.location();
        let demangled_name = merge_property(
            &location,
            "Function demangled name",
            &self.demangled_name,
            &other.demangled_name,
        )?;
        // Several mangled symbols (ctor/dtor variants) can share one demangled
        // name; keep the smallest so the result does not depend on order.
        let mangled_name = if demangled_name.is_some() {
            match (&self.mangled_name, &other.mangled_name) {
                (Some(l), Some(r)) => Some(l.min(r).clone()),
                (l, r) => l.clone().or_else(|| r.clone()),
            }
        } else {
            merge_property(
                &location,
                "Function mangled name",
                &self.mangled_name,
                &other.mangled_name,
            )?
        };

        self.demangled_name = demangled_name;
        self.mangled_name = mangled_name;

        if options.mode == MergeMode::Separate {
            for (lineno, count) in other.count {
                *self.count.entry(lineno).or_default() += count;
            }
            for (lineno, blocks) in other.blocks_percent {
                let entry = self.blocks_percent.entry(lineno).or_insert(blocks);
                *entry = entry.max(blocks);
            }
            for (lineno, excluded) in other.excluded {
                *self.excluded.entry(lineno).or_default() |= excluded;
            }
            if let Some(other_start) = other.start {
                let start = self.start.get_or_insert_with(BTreeMap::new);
                for (lineno, pos) in other_start {
                    let entry = start.entry(lineno).or_insert(pos);
                    *entry = (*entry).min(pos);
                }
            }
            if let Some(other_end) = other.end {
                let end = self.end.get_or_insert_with(BTreeMap::new);
                for (lineno, pos) in other_end {
                    let entry = end.entry(lineno).or_insert(pos);
                    *entry = (*entry).max(pos);
                }
            }
            return Ok(());
        }

        let Some(&right_lineno) = other.count.keys().next() else {
            return Ok(());
        };
        let lineno = if self.count.contains_key(&right_lineno) {
            right_lineno
        } else {
            let mut all = self.lines().chain(other.lines());
            match options.mode {
                MergeMode::MergeUseLine0 => 0,
                MergeMode::MergeUseLineMin => all.min().unwrap_or(right_lineno),
                MergeMode::MergeUseLineMax => all.max().unwrap_or(right_lineno),
                MergeMode::Strict | MergeMode::Separate => right_lineno,
            }
        };
        debug!(function = self.name(), lineno, "folding function records");

        let count: u64 = self.count.values().chain(other.count.values()).sum();
        let blocks = self
            .blocks_percent
            .values()
            .chain(other.blocks_percent.values())
            .copied()
            .fold(0.0, f64::max);
        let excluded = self
            .excluded
            .values()
            .chain(other.excluded.values())
            .any(|&e| e);
        let start = self
            .start
            .iter()
            .chain(other.start.iter())
            .flat_map(|m| m.values().copied())
            .min();
        let end = self
            .end
            .iter()
            .chain(other.end.iter())
            .flat_map(|m| m.values().copied())
            .max();

        self.count = BTreeMap::from([(lineno, count)]);
        self.blocks_percent = BTreeMap::from([(lineno, blocks)]);
        self.excluded = BTreeMap::from([(lineno, excluded)]);
        self.start = start.map(|pos| BTreeMap::from([(lineno, pos)]));
        self.end = end.map(|pos| BTreeMap::from([(lineno, pos)]));
        Ok(())
    }
}

impl Merge for FileCoverage {
    /// Conflicts are found before anything is merged, so a failed merge
    /// leaves `self` unchanged.
    fn merge(&mut self, other: Self, options: &MergeOptions) -> Result<()> {
        if self.filename != other.filename {
            return Err(MergeError::conflict(
                self.filename.clone(),
                format!("Filename must be equal, got {}.", other.filename),
            ));
        }
        for (key, line) in &other.lines {
            if let Some(existing) = self.lines.get(key) {
                existing
                    .check_mergeable(line)
                    .map_err(|e| e.in_file(&self.filename))?;
            }
        }
        for (key, function) in &other.functions {
            if let Some(existing) = self.functions.get(key) {
                existing
                    .check_mergeable(function, options)
                    .map_err(|e| e.in_file(&self.filename))?;
            }
        }

        merge_map(&mut self.lines, other.lines, options).map_err(|e| e.in_file(&self.filename))?;
        merge_map(&mut self.functions, other.functions, options)
            .map_err(|e| e.in_file(&self.filename))?;
        self.data_sources.extend(other.data_sources);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> MergeOptions {
        MergeOptions::default()
    }

    fn func(name: &str, lineno: u32, count: u64, blocks: f64) -> FunctionCoverage {
        FunctionCoverage::new(Some(name), None, lineno, count, blocks).unwrap()
    }

    // -- merge mode parsing ---------------------------------------------------

    #[test]
    fn test_merge_mode_round_trips_through_str() {
        for mode in MergeMode::ALL {
            assert_eq!(mode.as_str().parse::<MergeMode>().unwrap(), mode);
        }
        let err = "loose".parse::<MergeMode>().unwrap_err();
        assert!(err.contains("merge-use-line-min"), "{err}");
    }

    #[test]
    fn test_merge_mode_serde_names() {
        let json = serde_json::to_string(&MergeMode::MergeUseLine0).unwrap();
        assert_eq!(json, "\"merge-use-line-0\"");
        let mode: MergeMode = serde_json::from_str("\"separate\"").unwrap();
        assert_eq!(mode, MergeMode::Separate);
    }

    // -- branch / condition / call ----------------------------------------------

    #[test]
    fn test_branch_merge_sums_and_ors() {
        let mut left = BranchCoverage::new(0, 1);
        let right = BranchCoverage {
            count: 4,
            throw: true,
            excluded: true,
            destination_block_id: Some(7),
            ..BranchCoverage::new(0, 0)
        };
        left.merge(right, &strict()).unwrap();
        assert_eq!(left.count, 5);
        assert!(!left.fallthrough);
        assert!(left.throw);
        assert!(left.excluded);
        assert_eq!(left.destination_block_id, Some(7));
    }

    #[test]
    fn test_branch_merge_keeps_first_destination() {
        let mut left = BranchCoverage {
            destination_block_id: Some(3),
            ..BranchCoverage::new(1, 0)
        };
        let right = BranchCoverage {
            destination_block_id: Some(9),
            ..BranchCoverage::new(1, 0)
        };
        left.merge(right, &strict()).unwrap();
        assert_eq!(left.destination_block_id, Some(3));
    }

    #[test]
    fn test_condition_merge_intersects_uncovered_sets() {
        let mut left = ConditionCoverage::new(1, 4, 3, [0], []).unwrap();
        let right = ConditionCoverage::new(1, 4, 3, [], [1]).unwrap();
        left.merge(right, &strict()).unwrap();
        assert!(left.not_covered_true.is_empty());
        assert!(left.not_covered_false.is_empty());
        assert_eq!(left.covered, 4);
        assert!(left.is_fully_covered());
    }

    #[test]
    fn test_condition_merge_partial_overlap() {
        let mut left = ConditionCoverage::new(1, 6, 2, [1, 2], [0, 2]).unwrap();
        let right = ConditionCoverage::new(1, 6, 3, [2], [0, 1]).unwrap();
        left.merge(right, &strict()).unwrap();
        assert_eq!(left.not_covered_true, BTreeSet::from([2]));
        assert_eq!(left.not_covered_false, BTreeSet::from([0]));
        assert_eq!(left.covered, 4);
    }

    #[test]
    fn test_condition_merge_count_mismatch() {
        let mut left = ConditionCoverage::new(1, 4, 4, [], []).unwrap();
        let right = ConditionCoverage::new(1, 2, 2, [], []).unwrap();
        let err = left.merge(right, &strict()).unwrap_err();
        assert!(matches!(err, MergeError::StructuralConflict { .. }));
    }

    #[test]
    fn test_call_merge_is_or() {
        let mut left = CallCoverage::new(0, 0);
        left.merge(CallCoverage::new(0, 2), &strict()).unwrap();
        assert!(left.is_covered());
        assert_eq!(left.returned, 2);
    }

    // -- decision -----------------------------------------------------------------

    #[test]
    fn test_decision_merge_same_variant_sums() {
        let mut left = DecisionCoverage::Conditional {
            count_true: 1,
            count_false: 0,
        };
        left.merge(
            DecisionCoverage::Conditional {
                count_true: 0,
                count_false: 3,
            },
            &strict(),
        )
        .unwrap();
        assert_eq!(
            left,
            DecisionCoverage::Conditional {
                count_true: 1,
                count_false: 3
            }
        );

        let mut sw = DecisionCoverage::Switch { count: 2 };
        sw.merge(DecisionCoverage::Switch { count: 5 }, &strict())
            .unwrap();
        assert_eq!(sw, DecisionCoverage::Switch { count: 7 });
    }

    #[test]
    fn test_decision_merge_different_variant_fails() {
        let mut left = DecisionCoverage::Switch { count: 2 };
        let err = left
            .merge(DecisionCoverage::Uncheckable, &strict())
            .unwrap_err();
        assert!(matches!(err, MergeError::StructuralConflict { .. }));
        assert!(err.to_string().contains("switch and uncheckable"), "{err}");
        assert_eq!(left, DecisionCoverage::Switch { count: 2 });
    }

    // -- line -----------------------------------------------------------------------

    #[test]
    fn test_line_merge_flags() {
        let mut left = LineCoverage::new(4, None, 2).unwrap();
        left.noncode = true;
        left.block_ids = Some(BTreeSet::from([1, 2]));
        let mut right = LineCoverage::new(4, None, 0).unwrap();
        right.excluded = true;
        right.block_ids = Some(BTreeSet::from([2, 3]));
        right.md5 = Some("abc".to_string());

        left.merge(right, &strict()).unwrap();
        assert_eq!(left.count, 2);
        assert!(!left.noncode);
        assert!(left.excluded);
        assert_eq!(left.block_ids, Some(BTreeSet::from([1, 2, 3])));
        assert_eq!(left.md5.as_deref(), Some("abc"));
    }

    #[test]
    fn test_line_merge_md5_mismatch_is_source_changed() {
        let mut left = LineCoverage::new(4, None, 2).unwrap();
        left.md5 = Some("aaa".to_string());
        let mut right = LineCoverage::new(4, None, 1).unwrap();
        right.md5 = Some("bbb".to_string());

        let err = left.merge(right, &strict()).unwrap_err();
        assert!(matches!(err, MergeError::SourceChanged { .. }));
        // untouched on failure
        assert_eq!(left.count, 2);
    }

    #[test]
    fn test_line_merge_child_maps() {
        let mut left = LineCoverage::new(9, None, 1).unwrap();
        left.insert_branch(BranchCoverage::new(0, 1)).unwrap();
        left.insert_call(CallCoverage::new(0, 0)).unwrap();
        let mut right = LineCoverage::new(9, None, 1).unwrap();
        right.insert_branch(BranchCoverage::new(0, 2)).unwrap();
        right.insert_branch(BranchCoverage::new(1, 0)).unwrap();
        right
            .insert_decision(DecisionCoverage::Switch { count: 1 })
            .unwrap();

        left.merge(right, &strict()).unwrap();
        assert_eq!(left.branches.len(), 2);
        let counts: Vec<u64> = left.branches.values().map(|b| b.count).collect();
        assert_eq!(counts, vec![3, 0]);
        assert_eq!(left.calls.len(), 1);
        assert_eq!(left.decision, Some(DecisionCoverage::Switch { count: 1 }));
    }

    #[test]
    fn test_line_merge_decision_conflict_names_line() {
        let mut left = LineCoverage::new(9, None, 1).unwrap();
        left.decision = Some(DecisionCoverage::Switch { count: 1 });
        let mut right = LineCoverage::new(9, None, 1).unwrap();
        right.decision = Some(DecisionCoverage::Conditional {
            count_true: 1,
            count_false: 1,
        });
        let err = left.merge(right, &strict()).unwrap_err();
        assert_eq!(err.location(), "9");
        assert_eq!(left.count, 1);
    }

    #[test]
    fn test_line_merge_condition_conflict_location() {
        let mut left = LineCoverage::new(9, None, 1).unwrap();
        left.insert_condition(ConditionCoverage::new(2, 4, 4, [], []).unwrap())
            .unwrap();
        let mut right = LineCoverage::new(9, None, 1).unwrap();
        right
            .insert_condition(ConditionCoverage::new(2, 2, 2, [], []).unwrap())
            .unwrap();
        let err = left.merge(right, &strict()).unwrap_err();
        assert_eq!(err.location(), "9 (condition 2)");
    }

    // -- function -------------------------------------------------------------------

    #[test]
    fn test_function_strict_same_line_sums() {
        let mut left = func("foo", 3, 2, 50.0);
        left.merge(func("foo", 3, 1, 75.0), &strict()).unwrap();
        assert_eq!(left.count, BTreeMap::from([(3, 3)]));
        assert_eq!(left.blocks_percent, BTreeMap::from([(3, 75.0)]));
    }

    #[test]
    fn test_function_strict_conflict() {
        let mut left = func("foo", 3, 1, 0.0);
        let err = left.merge(func("foo", 5, 1, 0.0), &strict()).unwrap_err();
        assert!(matches!(err, MergeError::MergeAssertion { .. }));
        let msg = err.to_string();
        assert!(msg.contains("foo"), "{msg}");
        assert!(msg.contains("3, 5"), "{msg}");
        assert_eq!(err.exit_code(), 64);
    }

    #[test]
    fn test_function_line_modes() {
        let cases = [
            (MergeMode::MergeUseLine0, 0),
            (MergeMode::MergeUseLineMin, 3),
            (MergeMode::MergeUseLineMax, 5),
        ];
        for (mode, expected) in cases {
            let opts = MergeOptions::with_mode(mode);
            let mut left = func("foo", 5, 2, 10.0);
            left.merge(func("foo", 3, 4, 20.0), &opts).unwrap();
            assert_eq!(left.count, BTreeMap::from([(expected, 6)]), "{mode}");
            assert_eq!(left.blocks_percent, BTreeMap::from([(expected, 20.0)]));
        }
    }

    #[test]
    fn test_function_separate_keeps_lines() {
        let opts = MergeOptions::with_mode(MergeMode::Separate);
        let mut left = func("foo", 3, 1, 10.0);
        left.merge(func("foo", 5, 2, 20.0), &opts).unwrap();
        left.merge(func("foo", 3, 4, 5.0), &opts).unwrap();
        assert_eq!(left.count, BTreeMap::from([(3, 5), (5, 2)]));
        assert_eq!(left.blocks_percent, BTreeMap::from([(3, 10.0), (5, 20.0)]));
        assert_eq!(left.location(), "3 (5)");

        // A separated record is ambiguous for strict mode.
        let mut again = left.clone();
        assert!(again.merge(func("foo", 3, 1, 0.0), &strict()).is_err());
    }

    #[test]
    fn test_function_separate_positions_order_independent() {
        let opts = MergeOptions::with_mode(MergeMode::Separate);
        let a = func("foo", 3, 1, 0.0).with_position((3, 1), (9, 1));
        let b = func("foo", 3, 1, 0.0).with_position((3, 5), (12, 1));

        let mut ab = a.clone();
        ab.merge(b.clone(), &opts).unwrap();
        let mut ba = b;
        ba.merge(a, &opts).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.start, Some(BTreeMap::from([(3, (3, 1))])));
        assert_eq!(ab.end, Some(BTreeMap::from([(3, (12, 1))])));
    }

    #[test]
    fn test_function_position_folding() {
        let opts = MergeOptions::with_mode(MergeMode::MergeUseLineMin);
        let mut left = func("foo", 5, 0, 0.0).with_position((5, 1), (9, 2));
        let right = func("foo", 3, 0, 0.0).with_position((3, 4), (12, 1));
        left.merge(right, &opts).unwrap();
        assert_eq!(left.start, Some(BTreeMap::from([(3, (3, 4))])));
        assert_eq!(left.end, Some(BTreeMap::from([(3, (12, 1))])));
    }

    #[test]
    fn test_function_demangled_mismatch() {
        let mut left = FunctionCoverage::new(Some("_Z1fv"), Some("f()"), 1, 0, 0.0).unwrap();
        let right = FunctionCoverage::new(Some("_Z1fv"), Some("g()"), 1, 0, 0.0).unwrap();
        let err = left.merge(right, &strict()).unwrap_err();
        assert!(err.to_string().contains("demangled name must be equal"));
    }

    #[test]
    fn test_function_ctor_aliases_keep_smallest_mangled() {
        let mut left = FunctionCoverage::new(Some("_ZN1AC2Ev"), Some("A::A()"), 1, 1, 0.0).unwrap();
        let right = FunctionCoverage::new(Some("_ZN1AC1Ev"), Some("A::A()"), 1, 1, 0.0).unwrap();
        left.merge(right, &strict()).unwrap();
        assert_eq!(left.mangled_name.as_deref(), Some("_ZN1AC1Ev"));
        assert_eq!(left.count, BTreeMap::from([(1, 2)]));
    }

    // -- file -----------------------------------------------------------------------

    #[test]
    fn test_file_merge_filename_mismatch() {
        let mut left = FileCoverage::new("/a.c");
        let err = left.merge(FileCoverage::new("/b.c"), &strict()).unwrap_err();
        assert!(matches!(err, MergeError::StructuralConflict { .. }));
    }

    #[test]
    fn test_file_merge_error_carries_filename() {
        let opts = strict();
        let mut left = FileCoverage::new("/src/a.c");
        left.insert_function(func("foo", 3, 1, 0.0), &opts).unwrap();
        let mut right = FileCoverage::new("/src/a.c");
        right.insert_function(func("foo", 5, 1, 0.0), &opts).unwrap();
        let err = left.merge(right, &opts).unwrap_err();
        assert!(err.location().starts_with("/src/a.c:"), "{err}");
    }

    #[test]
    fn test_file_merge_conflict_leaves_file_unchanged() {
        let opts = strict();
        let line = |lineno: u32, count: u64, md5: &str| LineCoverage {
            md5: Some(md5.to_string()),
            ..LineCoverage::new(lineno, None, count).unwrap()
        };
        let mut left = FileCoverage::new("/src/a.c");
        left.insert_line(line(1, 1, "aa"), &opts).unwrap();
        left.insert_line(line(9, 1, "bb"), &opts).unwrap();
        let before = left.clone();

        let mut right = FileCoverage::new("/src/a.c");
        right.insert_line(line(1, 4, "aa"), &opts).unwrap();
        right.insert_line(line(2, 4, "cc"), &opts).unwrap();
        right.insert_line(line(9, 4, "dd"), &opts).unwrap();
        right.insert_function(func("foo", 1, 1, 0.0), &opts).unwrap();

        let err = left.merge(right, &opts).unwrap_err();
        assert!(matches!(err, MergeError::SourceChanged { .. }), "{err}");
        assert_eq!(left, before);
    }
}
