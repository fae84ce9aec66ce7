//! Outcome taxonomy for matrix runs.
//!
//! Leaves carry one of four kinds; composites bucket their children by kind
//! and derive their own kind by precedence. Merging concatenates buckets, so
//! aggregation order across workers never changes the overall kind or the
//! set of leaf messages, only display order.

use std::fmt;

/// Four-way classification of one action outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Fail,
    XFail,
    Pass,
    UPass,
}

impl OutcomeKind {
    /// Bucket order. Matches the summary's traversal order.
    pub const ALL: [OutcomeKind; 4] = [
        OutcomeKind::Fail,
        OutcomeKind::XFail,
        OutcomeKind::Pass,
        OutcomeKind::UPass,
    ];

    /// Merge precedence, strongest first: any FAIL dominates, then UPASS
    /// (a stale expectation is actionable), then XFAIL, then PASS.
    pub const PRECEDENCE: [OutcomeKind; 4] = [
        OutcomeKind::Fail,
        OutcomeKind::UPass,
        OutcomeKind::XFail,
        OutcomeKind::Pass,
    ];

    fn bucket(self) -> usize {
        match self {
            OutcomeKind::Fail => 0,
            OutcomeKind::XFail => 1,
            OutcomeKind::Pass => 2,
            OutcomeKind::UPass => 3,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::Fail => "FAIL",
            OutcomeKind::XFail => "XFAIL",
            OutcomeKind::Pass => "PASS",
            OutcomeKind::UPass => "UPASS",
        };
        f.write_str(name)
    }
}

/// One leaf outcome: a kind plus its human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub kind: OutcomeKind,
    pub message: String,
}

impl ActionOutcome {
    pub fn new(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A leaf or a nested composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Action(ActionOutcome),
    Set(OutcomeSet),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Action(action) => action.kind,
            Outcome::Set(set) => set.kind(),
        }
    }
}

/// Composite outcome container, children bucketed by their kind.
///
/// Children are bucketed at insertion time; both leaves and nested sets are
/// immutable once added, so the bucket never goes stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeSet {
    buckets: [Vec<Outcome>; 4],
}

impl OutcomeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, outcome: Outcome) {
        let bucket = outcome.kind().bucket();
        self.buckets[bucket].push(outcome);
    }

    pub fn add_action(&mut self, action: ActionOutcome) {
        self.add(Outcome::Action(action));
    }

    /// Concatenate the corresponding buckets of `self` and `other`.
    pub fn merge(mut self, other: OutcomeSet) -> OutcomeSet {
        for (into, from) in self.buckets.iter_mut().zip(other.buckets) {
            into.extend(from);
        }
        self
    }

    /// Effective kind: first kind in precedence order with a non-empty
    /// bucket. An empty set is PASS.
    pub fn kind(&self) -> OutcomeKind {
        for kind in OutcomeKind::PRECEDENCE {
            if !self.buckets[kind.bucket()].is_empty() {
                return kind;
            }
        }
        OutcomeKind::Pass
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Number of direct children (leaves and nested sets alike).
    pub fn direct_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// All leaf outcomes, recursively, in bucket-then-insertion order.
    pub fn leaves(&self) -> Vec<&ActionOutcome> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, into: &mut Vec<&'a ActionOutcome>) {
        for kind in OutcomeKind::ALL {
            for child in &self.buckets[kind.bucket()] {
                match child {
                    Outcome::Action(action) => into.push(action),
                    Outcome::Set(set) => set.collect_leaves(into),
                }
            }
        }
    }

    /// Number of leaves (recursively) of one kind.
    pub fn leaf_count(&self, kind: OutcomeKind) -> usize {
        self.leaves()
            .iter()
            .filter(|leaf| leaf.kind == kind)
            .count()
    }

    /// End-of-run report for this set (see [`Summary`]).
    pub fn summary(&self) -> Summary<'_> {
        Summary { set: self }
    }
}

/// Renders the end-of-run report: per-kind message sections for XFAIL,
/// UPASS, and FAIL leaves, leaf counts, the direct-child total, and the
/// merged kind.
pub struct Summary<'a> {
    set: &'a OutcomeSet,
}

const SEPARATOR: &str = "========================================";

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leaves = self.set.leaves();
        let of = |kind: OutcomeKind| -> Vec<&&ActionOutcome> {
            leaves.iter().filter(|leaf| leaf.kind == kind).collect()
        };
        let xfails = of(OutcomeKind::XFail);
        let upasses = of(OutcomeKind::UPass);
        let fails = of(OutcomeKind::Fail);
        let passes = of(OutcomeKind::Pass);

        let mut section = |title: &str, entries: &[&&ActionOutcome]| -> fmt::Result {
            if !entries.is_empty() {
                writeln!(f, "{SEPARATOR}")?;
                writeln!(f, "{title}:")?;
                for entry in entries {
                    writeln!(f, "  {}", entry.message)?;
                }
            }
            Ok(())
        };
        section("XFailures", &xfails)?;
        section("UPasses", &upasses)?;
        section("Failures", &fails)?;

        writeln!(f, "{SEPARATOR}")?;
        writeln!(f, "Action Summary:")?;
        writeln!(f, "     Passed: {}", passes.len())?;
        writeln!(f, "     Failed: {}", fails.len())?;
        writeln!(f, "    XFailed: {}", xfails.len())?;
        writeln!(f, "    UPassed: {}", upasses.len())?;
        writeln!(f, "      Total: {}", leaves.len())?;
        writeln!(f, "{SEPARATOR}")?;
        writeln!(f, "Repository Summary:")?;
        writeln!(f, "      Total: {}", self.set.direct_count())?;
        writeln!(f, "{SEPARATOR}")?;
        writeln!(f, "Result: {}", self.set.kind())?;
        write!(f, "{SEPARATOR}")
    }
}
