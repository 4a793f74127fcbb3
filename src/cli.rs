//! Command handler functions for the covrun CLI.
//!
//! Handlers return values or rendered `String`s instead of printing, so
//! they can be tested without capturing stdout.

use std::fmt::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::config::Settings;
use crate::driver::{Driver, EnvironmentGate, Mode, RunOptions, RunSummary};
use crate::export::CoverageTool;

/// Mode selector for the `report` command.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    Unit,
    E2eLocal,
    Combined,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Unit => Mode::Unit,
            ModeArg::E2eLocal => Mode::Integration,
            ModeArg::Combined => Mode::Combined,
        }
    }
}

/// Load the settings file if one was given, defaults otherwise.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(p) => Settings::load(p).with_context(|| format!("Failed to load settings from {}", p.display())),
        None => Ok(Settings::default()),
    }
}

/// Run one coverage mode end to end.
pub fn cmd_coverage(
    settings: Settings,
    tool: &dyn CoverageTool,
    gate: &dyn EnvironmentGate,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let mut driver = Driver::new(settings, tool, gate);
    let summary = driver
        .run(opts)
        .with_context(|| format!("{} coverage run failed", opts.mode))?;
    Ok(summary)
}

/// The console output for a finished run: the table, any warnings, and
/// where the artifacts went.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    writeln!(out, "{}", summary.table).unwrap();
    writeln!(out).unwrap();

    for warning in &summary.warnings {
        writeln!(out, "WARNING: {warning}").unwrap();
    }
    if let Some(count) = summary.profile_files {
        writeln!(out, "Profile files found: {count}").unwrap();
    }

    let paths = &summary.paths;
    writeln!(out, "Coverage reports generated in: {}", paths.dir.display()).unwrap();
    if paths.html.is_dir() {
        writeln!(out, "  HTML:    {}", paths.html.join("index.html").display()).unwrap();
    }
    for (label, path) in [
        ("Summary", &paths.summary),
        ("LCOV", &paths.lcov),
        ("JSON", &paths.json),
        ("Table", &paths.table),
    ] {
        if path.is_file() {
            writeln!(out, "  {label:<8} {}", path.display()).unwrap();
        }
    }

    let total = summary.report.total.lines.percent();
    let verdict = if summary.meets_threshold() { "meets" } else { "is below" };
    writeln!(
        out,
        "Total line coverage {total}% {verdict} the {}% threshold",
        summary.threshold
    )
    .unwrap();
    out
}

/// `Some(message)` when the run missed its threshold.
pub fn threshold_failure(summary: &RunSummary) -> Option<String> {
    if summary.meets_threshold() {
        return None;
    }
    Some(format!(
        "Total line coverage {}% is below the {}% threshold",
        summary.report.total.lines.percent(),
        summary.threshold
    ))
}
