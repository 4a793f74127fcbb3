//! Artifacts produced by the external coverage tool, and atomic writes of
//! every output file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{CovrunError, Result};

/// Encodings requested from the coverage tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Full structured dump (llvm-cov JSON export).
    Json,
    /// Per-line coverage in LCOV tracefile format.
    Lcov,
    /// Human-readable summary table.
    Summary,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Lcov => "lcov",
            ExportFormat::Summary => "summary",
        }
    }

    fn report_args(&self) -> &'static [&'static str] {
        match self {
            ExportFormat::Json => &["--json"],
            ExportFormat::Lcov => &["--lcov"],
            ExportFormat::Summary => &["--summary-only"],
        }
    }
}

/// The instrumentation/report tool. `LlvmCov` drives `cargo llvm-cov`.
pub trait CoverageTool {
    /// Remove previously collected instrumentation data.
    fn clean(&self) -> Result<()>;

    /// Render the collected data in `format` and return the bytes.
    fn export(&self, format: ExportFormat) -> Result<Vec<u8>>;

    /// Render the HTML report tree into `dir`.
    fn export_html(&self, dir: &Path) -> Result<()>;
}

pub struct LlvmCov {
    project_root: PathBuf,
}

impl LlvmCov {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    fn command(&self, args: &[&str]) -> (Command, String) {
        let mut cmd = Command::new("cargo");
        cmd.arg("llvm-cov").args(args).current_dir(&self.project_root);
        let cmdline = format!("cargo llvm-cov {}", args.join(" "));
        (cmd, cmdline)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Vec<u8>> {
        let (mut cmd, cmdline) = self.command(args);
        tracing::info!("> {cmdline}");
        let output = cmd.stdin(Stdio::null()).output()?;
        if !output.status.success() {
            return Err(CovrunError::ToolFailed {
                command: cmdline,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl CoverageTool for LlvmCov {
    fn clean(&self) -> Result<()> {
        self.run_checked(&["clean", "--workspace"]).map(|_| ())
    }

    fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        let mut args = vec!["report"];
        args.extend_from_slice(format.report_args());
        self.run_checked(&args)
    }

    fn export_html(&self, dir: &Path) -> Result<()> {
        // The tool runs from the project root.
        let dir = dir.canonicalize()?;
        let dir_str = dir.to_string_lossy();
        self.run_checked(&["report", "--html", "--output-dir", &dir_str])
            .map(|_| ())
    }
}

/// Deterministic output locations under one mode's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub html: PathBuf,
    pub summary: PathBuf,
    pub lcov: PathBuf,
    pub json: PathBuf,
    pub table: PathBuf,
    pub server_log: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            html: dir.join("html"),
            summary: dir.join("summary.txt"),
            lcov: dir.join("lcov.info"),
            json: dir.join("coverage.json"),
            table: dir.join("coverage_report.txt"),
            server_log: dir.join("server.log"),
            dir,
        }
    }

    pub fn for_format(&self, format: ExportFormat) -> &Path {
        match format {
            ExportFormat::Json => &self.json,
            ExportFormat::Lcov => &self.lcov,
            ExportFormat::Summary => &self.summary,
        }
    }
}

/// Write `bytes` to `path` through a temporary file in the same directory,
/// so readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| CovrunError::Io(e.error))?;
    Ok(())
}

/// Export one encoding and persist it at its artifact path. Returns the
/// exported bytes.
pub fn emit(tool: &dyn CoverageTool, format: ExportFormat, paths: &ArtifactPaths) -> Result<Vec<u8>> {
    let bytes = tool.export(format)?;
    let path = paths.for_format(format);
    write_atomic(path, &bytes)?;
    tracing::info!(format = format.as_str(), path = %path.display(), "report written");
    Ok(bytes)
}

/// Render the HTML tree into a scratch directory, flatten a nested `html/`
/// level if the tool created one, and swap it into place.
pub fn emit_html(tool: &dyn CoverageTool, paths: &ArtifactPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)?;
    let scratch = tempfile::Builder::new()
        .prefix(".html-")
        .tempdir_in(&paths.dir)?;
    tool.export_html(scratch.path())?;

    let nested = scratch.path().join("html");
    let rendered = if nested.is_dir() { nested } else { scratch.path().to_path_buf() };

    if paths.html.exists() {
        std::fs::remove_dir_all(&paths.html)?;
    }
    std::fs::rename(&rendered, &paths.html)?;
    tracing::info!(path = %paths.html.join("index.html").display(), "HTML report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticTool;

    impl CoverageTool for StaticTool {
        fn clean(&self) -> Result<()> {
            Ok(())
        }

        fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
            Ok(format!("{} output", format.as_str()).into_bytes())
        }

        fn export_html(&self, dir: &Path) -> Result<()> {
            let nested = dir.join("html");
            std::fs::create_dir_all(&nested)?;
            std::fs::write(nested.join("index.html"), "<html></html>")?;
            Ok(())
        }
    }

    #[test]
    fn test_artifact_paths() {
        let paths = ArtifactPaths::new("coverage/unit");
        assert_eq!(paths.json, PathBuf::from("coverage/unit/coverage.json"));
        assert_eq!(paths.lcov, PathBuf::from("coverage/unit/lcov.info"));
        assert_eq!(paths.summary, PathBuf::from("coverage/unit/summary.txt"));
        assert_eq!(paths.table, PathBuf::from("coverage/unit/coverage_report.txt"));
        assert_eq!(paths.for_format(ExportFormat::Lcov), paths.lcov.as_path());
    }

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("summary.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_emit_writes_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        for format in [ExportFormat::Json, ExportFormat::Lcov, ExportFormat::Summary] {
            let bytes = emit(&StaticTool, format, &paths).unwrap();
            assert_eq!(std::fs::read(paths.for_format(format)).unwrap(), bytes);
        }
        assert_eq!(std::fs::read_to_string(&paths.lcov).unwrap(), "lcov output");
    }

    #[test]
    fn test_emit_html_flattens_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        std::fs::create_dir_all(paths.html.join("stale")).unwrap();

        emit_html(&StaticTool, &paths).unwrap();

        assert!(paths.html.join("index.html").is_file());
        assert!(!paths.html.join("html").exists());
        assert!(!paths.html.join("stale").exists());
        // Only the html directory remains; the scratch dir is gone.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("html")]);
    }
}
