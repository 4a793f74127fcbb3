/// Parser for the `llvm-cov export -format=text` JSON document, as printed
/// by `cargo llvm-cov report --json`.
///
/// Only the per-file summaries are read:
///
/// ```text
/// { "type": "llvm.coverage.json.export", "version": "2.0.1",
///   "data": [ { "files": [ { "filename": "...",
///                            "summary": { "lines":     { "count": 10, "covered": 8, ... },
///                                         "functions": { ... },
///                                         "regions":   { ... } } } ],
///               "totals": { ... } } ] }
/// ```
///
/// Every file must carry all three summaries with `count` and `covered`;
/// anything else is rejected at ingestion.
use serde::Deserialize;

use super::Parser;
use crate::error::{CovrunError, Result};
use crate::model::{CoverageMetric, FileRecord, Metrics};

pub struct LlvmCovParser;

impl Parser for LlvmCovParser {
    fn parse(&self, input: &[u8]) -> Result<Vec<FileRecord>> {
        parse(input)
    }
}

#[derive(Deserialize)]
struct Export {
    data: Vec<ExportData>,
}

#[derive(Deserialize)]
struct ExportData {
    files: Vec<ExportFile>,
}

#[derive(Deserialize)]
struct ExportFile {
    filename: String,
    summary: Summary,
}

#[derive(Deserialize)]
struct Summary {
    regions: Counts,
    functions: Counts,
    lines: Counts,
}

#[derive(Deserialize)]
struct Counts {
    count: u64,
    covered: u64,
}

impl Counts {
    fn into_metric(self, filename: &str, kind: &str) -> Result<CoverageMetric> {
        if self.covered > self.count {
            return Err(CovrunError::Parse(format!(
                "{filename}: {kind} covered ({}) exceeds count ({})",
                self.covered, self.count
            )));
        }
        Ok(CoverageMetric::new(self.covered, self.count))
    }
}

/// Parse an llvm-cov JSON export. Empty (or whitespace-only) input yields
/// no records.
pub fn parse(input: &[u8]) -> Result<Vec<FileRecord>> {
    if input.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    let export: Export = serde_json::from_slice(input)
        .map_err(|e| CovrunError::Parse(format!("Invalid llvm-cov JSON export: {e}")))?;

    let mut records = Vec::new();
    for data in export.data {
        for file in data.files {
            let ExportFile { filename, summary } = file;
            let metrics = Metrics {
                regions: summary.regions.into_metric(&filename, "regions")?,
                functions: summary.functions.into_metric(&filename, "functions")?,
                lines: summary.lines.into_metric(&filename, "lines")?,
            };
            records.push(FileRecord { filename, metrics });
        }
    }
    Ok(records)
}
