#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use covrun::driver::{EnvironmentGate, Mode};
use covrun::error::{CovrunError, Result};
use covrun::export::{CoverageTool, ExportFormat};
use covrun::workload::CommandSpec;

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve HTTP on `listener` from a background thread, answering every
/// request with the status `respond` picks for its path.
pub fn serve_http<F>(listener: TcpListener, respond: F)
where
    F: Fn(&str) -> u16 + Send + 'static,
{
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                // Bare TCP probe.
                continue;
            }
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header) {
                    Ok(0) => break,
                    Ok(_) if header == "\r\n" || header == "\n" => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let path = request_line.split_whitespace().nth(1).unwrap_or("/");
            let status = respond(path);
            let _ = write!(
                stream,
                "HTTP/1.1 {status} Stub\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
        }
    });
}

/// Poll until `path` exists.
pub fn wait_for_file(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

/// Write `relative` under `root`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

/// `(filename, regions, functions, lines)` with `(covered, count)` pairs.
pub type Row<'a> = (&'a str, (u64, u64), (u64, u64), (u64, u64));

/// An llvm-cov JSON export holding the given file summaries.
pub fn llvm_cov_json(rows: &[Row]) -> String {
    let counts = |(covered, count): (u64, u64)| {
        let percent = if count == 0 {
            0.0
        } else {
            covered as f64 * 100.0 / count as f64
        };
        serde_json::json!({
            "count": count,
            "covered": covered,
            "notcovered": count - covered,
            "percent": percent,
        })
    };
    let files: Vec<_> = rows
        .iter()
        .map(|(name, regions, functions, lines)| {
            serde_json::json!({
                "filename": name,
                "segments": [],
                "summary": {
                    "regions": counts(*regions),
                    "functions": counts(*functions),
                    "lines": counts(*lines),
                    "instantiations": counts(*functions),
                    "branches": counts((0, 0)),
                }
            })
        })
        .collect();
    serde_json::json!({
        "type": "llvm.coverage.json.export",
        "version": "2.0.1",
        "data": [{ "files": files, "functions": [], "totals": {} }],
    })
    .to_string()
}

/// Coverage tool stand-in that serves a fixed JSON export and records
/// which operations were called.
pub struct FakeTool {
    json: Option<String>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeTool {
    pub fn new(json: String) -> Self {
        Self {
            json: Some(json),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// A tool that has no collected data to export.
    pub fn without_data() -> Self {
        Self {
            json: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CoverageTool for FakeTool {
    fn clean(&self) -> Result<()> {
        self.calls.borrow_mut().push("clean".to_string());
        Ok(())
    }

    fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        self.calls.borrow_mut().push(format!("export {}", format.as_str()));
        let Some(json) = &self.json else {
            return Err(CovrunError::ToolFailed {
                command: "cargo llvm-cov report".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "error: no input files specified".to_string(),
            });
        };
        Ok(match format {
            ExportFormat::Json => json.clone().into_bytes(),
            ExportFormat::Lcov => b"SF:libs/b/y.rs\nend_of_record\n".to_vec(),
            ExportFormat::Summary => b"TOTAL 86.00%\n".to_vec(),
        })
    }

    fn export_html(&self, dir: &Path) -> Result<()> {
        self.calls.borrow_mut().push("export html".to_string());
        let nested = dir.join("html");
        std::fs::create_dir_all(&nested)?;
        std::fs::write(nested.join("index.html"), "<html></html>")?;
        Ok(())
    }
}

/// Environment gate with a fixed answer.
pub struct StaticGate(pub bool);

impl EnvironmentGate for StaticGate {
    fn environment_ready(&self, _mode: Mode) -> bool {
        self.0
    }
}
