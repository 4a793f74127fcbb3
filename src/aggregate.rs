//! Path normalization, classification and summation of per-file counters
//! into files, groups and one workspace total.
//!
//! Every non-external file is added exactly once: to the file list, to at
//! most one group, and to the total. Groups and the total are never
//! re-derived from each other.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CovrunError, Result};
use crate::model::{CoverageMetric, CoverageReport, FileCoverage, FileRecord, GroupCoverage, GroupKind, Metrics};

/// Directory prefixes that decide which group a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub library_root: String,
    pub module_root: String,
    pub application_root: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            library_root: "libs".to_string(),
            module_root: "modules".to_string(),
            application_root: "apps".to_string(),
        }
    }
}

impl Layout {
    fn roots(&self) -> [&str; 3] {
        [&self.library_root, &self.module_root, &self.application_root]
    }
}

/// Where a file's counts end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    /// Owned by a library or module directory.
    Group(GroupKind, String),
    /// Part of the workspace but not grouped (application files).
    Standalone,
    /// Dependency or toolchain source; excluded from groups and the total.
    External,
}

fn has_root(path: &str, root: &str) -> bool {
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn strip_dot_slash(path: &str) -> &str {
    path.strip_prefix("./").unwrap_or(path)
}

/// Normalize a coverage path to be relative to `project_root`: unify
/// separators, strip a leading `./`, and strip the root when the path is
/// absolute. Paths outside the root are returned as-is.
#[must_use]
pub fn normalize_path(raw: &str, project_root: &Path, layout: &Layout) -> String {
    let unified = raw.replace('\\', "/");
    let s = strip_dot_slash(&unified);

    if layout.roots().iter().any(|root| has_root(s, root)) {
        return s.to_string();
    }

    let root = project_root.to_string_lossy().replace('\\', "/");
    let root = root.trim_end_matches('/');
    if !root.is_empty() && root != "." {
        if let Some(rest) = s.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
            return strip_dot_slash(rest).to_string();
        }
    }
    s.to_string()
}

/// Classify a normalized relative path.
#[must_use]
pub fn classify(rel_path: &str, layout: &Layout) -> Category {
    let rel_path = strip_dot_slash(rel_path);
    let grouped = [
        (&layout.library_root, GroupKind::Library),
        (&layout.module_root, GroupKind::Module),
    ];
    for (root, kind) in grouped {
        if has_root(rel_path, root) {
            return match rel_path.split('/').nth(1) {
                Some(name) if !name.is_empty() => Category::Group(kind, name.to_string()),
                _ => Category::Standalone,
            };
        }
    }
    if has_root(rel_path, &layout.application_root) {
        return Category::Standalone;
    }
    Category::External
}

/// Approximate line count for a file that produced no instrumented data.
pub fn count_non_blank_lines(path: &Path) -> std::io::Result<u64> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.lines().filter(|l| !l.trim().is_empty()).count() as u64)
}

/// Running accumulator. Feed it records, optionally expand it to the
/// whole project, then `finish` it into a report.
pub struct Aggregator {
    project_root: PathBuf,
    layout: Layout,
    files: Vec<FileCoverage>,
    seen: HashSet<String>,
    groups: BTreeMap<(GroupKind, String), Metrics>,
    total: Metrics,
    instrumented_files: usize,
}

impl Aggregator {
    pub fn new(project_root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            project_root: project_root.into(),
            layout,
            files: Vec::new(),
            seen: HashSet::new(),
            groups: BTreeMap::new(),
            total: Metrics::default(),
            instrumented_files: 0,
        }
    }

    pub fn add_record(&mut self, record: &FileRecord) {
        self.instrumented_files += 1;
        let path = normalize_path(&record.filename, &self.project_root, &self.layout);
        match classify(&path, &self.layout) {
            Category::External => {
                tracing::trace!(path = %path, "skipping external file");
            }
            category => self.add(path, category, record.metrics),
        }
    }

    pub fn add_records(&mut self, records: &[FileRecord]) {
        for record in records {
            self.add_record(record);
        }
    }

    fn add(&mut self, path: String, category: Category, metrics: Metrics) {
        if let Category::Group(kind, name) = category {
            *self.groups.entry((kind, name)).or_default() += metrics;
        }
        self.total += metrics;
        self.seen.insert(path.clone());
        self.files.push(FileCoverage { path, metrics });
    }

    /// Add a zero-coverage entry for every `.rs` file under the library and
    /// module roots that has no instrumented data, with the non-blank line
    /// count as its line total. Returns the number of files added.
    pub fn expand_to_project(&mut self) -> Result<usize> {
        let mut added = 0;
        let tops = [self.layout.library_root.clone(), self.layout.module_root.clone()];
        for top in tops {
            let dir = self.project_root.join(&top);
            if !dir.is_dir() {
                continue;
            }
            let pattern = dir.join("**").join("*.rs");
            let entries = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| CovrunError::Parse(format!("Bad glob pattern: {e}")))?;
            for entry in entries {
                let abs = entry.map_err(|e| CovrunError::Io(e.into()))?;
                let rel = match abs.strip_prefix(&self.project_root) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => normalize_path(&abs.to_string_lossy(), &self.project_root, &self.layout),
                };
                if self.seen.contains(&rel) {
                    continue;
                }
                let category = classify(&rel, &self.layout);
                if category == Category::External {
                    continue;
                }
                let lines = count_non_blank_lines(&abs)?;
                let metrics = Metrics {
                    lines: CoverageMetric::new(0, lines),
                    ..Metrics::default()
                };
                self.add(rel, category, metrics);
                added += 1;
            }
        }
        tracing::debug!(added, "expanded report to untested project files");
        Ok(added)
    }

    #[must_use]
    pub fn finish(self) -> CoverageReport {
        let mut files = self.files;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let groups = self
            .groups
            .into_iter()
            .map(|((kind, name), metrics)| GroupCoverage { name, kind, metrics })
            .collect();
        CoverageReport {
            files,
            groups,
            total: self.total,
            instrumented_files: self.instrumented_files,
        }
    }
}

/// Aggregate raw records into files, groups and a total.
#[must_use]
pub fn aggregate(records: &[FileRecord], project_root: &Path, layout: &Layout) -> CoverageReport {
    let mut agg = Aggregator::new(project_root, layout.clone());
    agg.add_records(records);
    agg.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::default()
    }

    #[test]
    fn test_normalize_strips_dot_slash() {
        assert_eq!(
            normalize_path("./libs/foo/src/bar.rs", Path::new("/work"), &layout()),
            "libs/foo/src/bar.rs"
        );
    }

    #[test]
    fn test_normalize_unifies_separators() {
        assert_eq!(
            normalize_path(r"modules\a\src\x.rs", Path::new("/work"), &layout()),
            "modules/a/src/x.rs"
        );
    }

    #[test]
    fn test_normalize_strips_project_root() {
        assert_eq!(
            normalize_path("/work/apps/server/src/main.rs", Path::new("/work/"), &layout()),
            "apps/server/src/main.rs"
        );
    }

    #[test]
    fn test_normalize_leaves_outside_paths() {
        let p = "/home/u/.cargo/registry/src/serde/lib.rs";
        assert_eq!(normalize_path(p, Path::new("/work"), &layout()), p);
    }

    #[test]
    fn test_normalize_root_prefix_needs_separator() {
        // "/workspace" must not be treated as being under "/work".
        let p = "/workspace/libs/a/lib.rs";
        assert_eq!(normalize_path(p, Path::new("/work"), &layout()), p);
    }

    #[test]
    fn test_classify() {
        let l = layout();
        assert_eq!(
            classify("libs/foo/src/bar.rs", &l),
            Category::Group(GroupKind::Library, "foo".to_string())
        );
        assert_eq!(
            classify("./modules/api_ingress/src/lib.rs", &l),
            Category::Group(GroupKind::Module, "api_ingress".to_string())
        );
        assert_eq!(classify("apps/server/src/main.rs", &l), Category::Standalone);
        assert_eq!(classify("libs/", &l), Category::Standalone);
        assert_eq!(classify("librs/foo.rs", &l), Category::External);
        assert_eq!(classify("/rustc/abc/library/core/src/lib.rs", &l), Category::External);
    }

    #[test]
    fn test_classify_custom_layout() {
        let l = Layout {
            library_root: "crates".to_string(),
            module_root: "plugins".to_string(),
            application_root: "bin".to_string(),
        };
        assert_eq!(
            classify("crates/core/src/lib.rs", &l),
            Category::Group(GroupKind::Library, "core".to_string())
        );
        assert_eq!(classify("bin/main.rs", &l), Category::Standalone);
        assert_eq!(classify("libs/foo/src/lib.rs", &l), Category::External);
    }

    #[test]
    fn test_count_non_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, "fn main() {\n\n    \n    let x = 1;\n}\n").unwrap();
        assert_eq!(count_non_blank_lines(&path).unwrap(), 3);
        assert_eq!(count_non_blank_lines(&dir.path().join("missing.rs")).unwrap(), 0);
    }
}
