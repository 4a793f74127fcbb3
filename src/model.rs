//! Uniform in-memory representation of coverage counts. Parsers produce
//! `FileRecord`s, the aggregator turns them into a `CoverageReport`.

use std::fmt;
use std::ops::AddAssign;

/// Compute a whole-number coverage percentage, returning 0 when the total
/// is zero. Halves round up, so 12/14 is 86 and 1/8 is 13. This differs
/// from banker's rounding (half to even), which would give 12 for 1/8 and
/// 2 for 1/40.
#[must_use]
pub fn pct(covered: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        (covered * 200 + total) / (total * 2)
    }
}

/// A covered/total pair for one metric kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageMetric {
    pub covered: u64,
    pub total: u64,
}

impl CoverageMetric {
    #[must_use]
    pub const fn new(covered: u64, total: u64) -> Self {
        Self { covered, total }
    }

    #[must_use]
    pub fn percent(&self) -> u64 {
        pct(self.covered, self.total)
    }

    #[must_use]
    pub fn missed(&self) -> u64 {
        self.total.saturating_sub(self.covered)
    }
}

impl AddAssign for CoverageMetric {
    fn add_assign(&mut self, rhs: Self) {
        self.covered += rhs.covered;
        self.total += rhs.total;
    }
}

/// The three independent metrics tracked for every file, group and total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub regions: CoverageMetric,
    pub functions: CoverageMetric,
    pub lines: CoverageMetric,
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Self) {
        self.regions += rhs.regions;
        self.functions += rhs.functions;
        self.lines += rhs.lines;
    }
}

/// One record as read from the instrumentation tool, before the path is
/// normalized or classified.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub filename: String,
    pub metrics: Metrics,
}

/// Coverage for a single source file, path relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCoverage {
    pub path: String,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKind {
    Library,
    Module,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Library => "lib",
            GroupKind::Module => "module",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollup of every file sharing a library or module directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCoverage {
    pub name: String,
    pub kind: GroupKind,
    pub metrics: Metrics,
}

impl GroupCoverage {
    /// Label used in the report, e.g. `module/api_ingress`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Aggregated result: individual files, groups and the workspace total.
#[derive(Debug, Clone, Default)]
pub struct CoverageReport {
    /// Non-external files, sorted by path.
    pub files: Vec<FileCoverage>,
    /// Groups sorted by kind, then name.
    pub groups: Vec<GroupCoverage>,
    pub total: Metrics,
    /// Number of records in the raw dataset, external files included.
    pub instrumented_files: usize,
}

impl CoverageReport {
    #[must_use]
    pub fn group(&self, kind: GroupKind, name: &str) -> Option<&GroupCoverage> {
        self.groups
            .iter()
            .find(|g| g.kind == kind && g.name == name)
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<&FileCoverage> {
        self.files.iter().find(|f| f.path == path)
    }
}
