//! Fixed-width ASCII coverage table.
//!
//! Three sections in fixed order (individual files, modules & libraries,
//! total), each row rendered by [`format_row`].

use std::io::IsTerminal;

use crate::model::{CoverageMetric, CoverageReport, Metrics};

pub const NAME_COL_WIDTH: usize = 70;
pub const CELL_COL_WIDTH: usize = 18;
pub const SEPARATOR_WIDTH: usize = NAME_COL_WIDTH + CELL_COL_WIDTH * 3;

/// Default minimum acceptable coverage percentage.
pub const DEFAULT_THRESHOLD: u64 = 70;

const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const RESET: &str = "\x1b[0m";

/// Marker printed in front of a cell that is below the threshold.
pub const BELOW_THRESHOLD_MARKER: char = '!';

/// Decide whether ANSI colors may be used. Color needs an interactive
/// terminal, no (non-empty) `NO_COLOR`, and a terminal type other than
/// `dumb`.
#[must_use]
pub fn color_supported(is_tty: bool, no_color: Option<&str>, term: Option<&str>) -> bool {
    if !is_tty {
        return false;
    }
    if no_color.is_some_and(|v| !v.is_empty()) {
        return false;
    }
    term != Some("dumb")
}

/// Color detection for stdout using the process environment.
#[must_use]
pub fn detect_color() -> bool {
    let no_color = std::env::var("NO_COLOR").ok();
    let term = std::env::var("TERM").ok();
    color_supported(
        std::io::stdout().is_terminal(),
        no_color.as_deref(),
        term.as_deref(),
    )
}

/// Rendering options for the table.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub threshold: u64,
    pub color: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            color: false,
        }
    }
}

/// Render one metric as `<marker><pct> % (<missed>)`, padded to the cell
/// width before any color codes are applied.
#[must_use]
pub fn format_cell(metric: &CoverageMetric, opts: &TableOptions) -> String {
    let percent = metric.percent();
    let below = percent < opts.threshold;
    let marker = if below { BELOW_THRESHOLD_MARKER } else { ' ' };
    let text = format!("{marker}{percent:>3} % ({})", metric.missed());
    let padded = format!("{text:<CELL_COL_WIDTH$}");
    if opts.color {
        let code = if below { RED } else { GREEN };
        format!("{code}{padded}{RESET}")
    } else {
        padded
    }
}

/// Shorten `name` from the left so the tail (the file name) stays visible.
#[must_use]
pub fn truncate_left(name: &str, width: usize) -> String {
    let len = name.chars().count();
    if len + 2 <= width {
        return name.to_string();
    }
    let keep = width.saturating_sub(3);
    let tail: String = name.chars().skip(len - keep.min(len)).collect();
    format!("...{tail}")
}

/// Format a single row: name column followed by regions, functions, lines.
#[must_use]
pub fn format_row(name: &str, metrics: &Metrics, opts: &TableOptions) -> String {
    let name = truncate_left(name, NAME_COL_WIDTH);
    format!(
        "{name:<NAME_COL_WIDTH$} {} {} {}",
        format_cell(&metrics.regions, opts),
        format_cell(&metrics.functions, opts),
        format_cell(&metrics.lines, opts),
    )
}

fn section_header(title: &str, separator: char) -> Vec<String> {
    let rule = separator.to_string().repeat(SEPARATOR_WIDTH);
    let header = |name: &str, cell: &str| {
        format!("{name:<NAME_COL_WIDTH$} {cell:<CELL_COL_WIDTH$} {cell:<CELL_COL_WIDTH$} {cell:<CELL_COL_WIDTH$}")
    };
    vec![
        rule.clone(),
        format!(
            "{title:<NAME_COL_WIDTH$} {:<CELL_COL_WIDTH$} {:<CELL_COL_WIDTH$} {:<CELL_COL_WIDTH$}",
            "Regions", "Functions", "Lines"
        ),
        header("", "Coverage %"),
        header("", "(missed)"),
        rule,
    ]
}

/// Render the full report.
#[must_use]
pub fn format_report(report: &CoverageReport, opts: &TableOptions) -> String {
    let banner = "=".repeat(SEPARATOR_WIDTH);
    let mut lines = vec![
        banner.clone(),
        "COVERAGE REPORT".to_string(),
        banner.clone(),
        String::new(),
        format!(
            "Files covered: {} out of {} total instrumented files",
            report.files.len(),
            report.instrumented_files
        ),
        format!("Coverage threshold: {}%", opts.threshold),
    ];
    if opts.color {
        lines.push(format!(
            "Color coding: {GREEN}green{RESET} = above threshold, {RED}red{RESET} = below threshold"
        ));
    }
    lines.push(String::new());

    lines.extend(section_header("Individual Files:", '-'));
    for file in &report.files {
        lines.push(format_row(&file.path, &file.metrics, opts));
    }

    lines.push(String::new());
    lines.extend(section_header("Modules & Libraries:", '-'));
    for group in &report.groups {
        lines.push(format_row(&group.label(), &group.metrics, opts));
    }

    lines.push(String::new());
    lines.extend(section_header("Total:", '='));
    lines.push(format_row("TOTAL", &report.total, opts));
    lines.push(banner);

    lines.join("\n")
}
