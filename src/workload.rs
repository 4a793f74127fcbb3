//! Test workload execution.
//!
//! A workload whose tests fail still produced usable coverage, so that is
//! an outcome, not an error. Only a workload that could not run at all
//! (missing program, killed by a signal, or an exit code the command spec
//! declares fatal) becomes `CovrunError::WorkloadExecution`.

use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::{CovrunError, Result};

/// A program plus its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes meaning the runner failed before any test ran.
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: impl Into<String>, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            fatal_exit_codes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fatal_exit_codes(mut self, codes: &[i32]) -> Self {
        self.fatal_exit_codes = codes.to_vec();
        self
    }

    /// A `Command` for this spec with `extra` arguments appended.
    pub fn command(&self, extra: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(extra);
        cmd
    }

    /// Human-readable command line, `extra` arguments included.
    pub fn display_with(&self, extra: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(extra.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_with(&[]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Passed,
    /// Tests ran and some failed; coverage is still valid.
    TestsFailed { code: i32 },
}

impl WorkloadOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, WorkloadOutcome::Passed)
    }
}

/// Run `spec` with `extra` arguments and additional environment, inheriting
/// stdout/stderr so test output goes to the console.
pub fn run(
    spec: &CommandSpec,
    extra: &[String],
    env: &[(String, String)],
    cwd: &Path,
) -> Result<WorkloadOutcome> {
    let cmdline = spec.display_with(extra);
    tracing::info!("> {cmdline}");

    let status = spec
        .command(extra)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| CovrunError::WorkloadExecution {
            command: cmdline.clone(),
            reason: e.to_string(),
        })?;

    if status.success() {
        return Ok(WorkloadOutcome::Passed);
    }
    match status.code() {
        Some(code) if spec.fatal_exit_codes.contains(&code) => Err(CovrunError::WorkloadExecution {
            command: cmdline,
            reason: format!("runner exited with code {code} before running tests"),
        }),
        Some(code) => Ok(WorkloadOutcome::TestsFailed { code }),
        None => Err(CovrunError::WorkloadExecution {
            command: cmdline,
            reason: format!("terminated abnormally ({status})"),
        }),
    }
}

/// Run the unit-test workload, scoped to one package when `scope_filter`
/// is given and to the whole workspace otherwise.
pub fn run_unit_tests(
    spec: &CommandSpec,
    env: &[(String, String)],
    cwd: &Path,
    scope_filter: Option<&str>,
) -> Result<WorkloadOutcome> {
    let extra = match scope_filter {
        Some(package) => {
            tracing::info!(package, "filtering unit tests");
            vec!["--package".to_string(), package.to_string()]
        }
        None => vec!["--workspace".to_string()],
    };
    run(spec, &extra, env, cwd)
}

/// Run the integration-test workload against `base_url`, exported to the
/// runner as `base_url_var`.
pub fn run_integration_tests(
    spec: &CommandSpec,
    base_url_var: &str,
    base_url: &str,
    env: &[(String, String)],
    cwd: &Path,
    test_filter: Option<&str>,
) -> Result<WorkloadOutcome> {
    let mut env = env.to_vec();
    env.push((base_url_var.to_string(), base_url.to_string()));
    let extra = match test_filter {
        Some(filter) => vec!["-k".to_string(), filter.to_string()],
        None => Vec::new(),
    };
    run(spec, &extra, &env, cwd)
}

/// Check that `program` is installed by running it with `version_args`.
pub fn ensure_tool(program: &str, version_args: &[&str], hint: &str) -> Result<()> {
    let status = Command::new(program)
        .args(version_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let tool = std::iter::once(program)
        .chain(version_args.iter().copied().filter(|a| !a.starts_with('-')))
        .collect::<Vec<_>>()
        .join(" ");
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => {
            tracing::debug!(tool = %tool, status = %s, "version check failed");
            Err(CovrunError::ToolMissing {
                tool,
                hint: hint.to_string(),
            })
        }
        Err(e) => {
            tracing::debug!(tool = %tool, error = %e, "could not run version check");
            Err(CovrunError::ToolMissing {
                tool,
                hint: hint.to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn test_display_with() {
        let spec = CommandSpec::new("cargo", ["llvm-cov", "--no-report"]);
        assert_eq!(
            spec.display_with(&["--workspace".to_string()]),
            "cargo llvm-cov --no-report --workspace"
        );
        assert_eq!(spec.to_string(), "cargo llvm-cov --no-report");
    }

    #[test]
    fn test_run_passed() {
        let cwd = std::env::temp_dir();
        let outcome = run(&sh("exit 0"), &[], &[], &cwd).unwrap();
        assert_eq!(outcome, WorkloadOutcome::Passed);
        assert!(outcome.passed());
    }

    #[test]
    fn test_run_tests_failed_is_not_an_error() {
        let cwd = std::env::temp_dir();
        let outcome = run(&sh("exit 1"), &[], &[], &cwd).unwrap();
        assert_eq!(outcome, WorkloadOutcome::TestsFailed { code: 1 });
    }

    #[test]
    fn test_run_fatal_exit_code() {
        let cwd = std::env::temp_dir();
        let spec = sh("exit 4").with_fatal_exit_codes(&[3, 4]);
        let err = run(&spec, &[], &[], &cwd).unwrap_err();
        assert!(matches!(err, CovrunError::WorkloadExecution { .. }), "{err}");
    }

    #[test]
    fn test_run_missing_program() {
        let cwd = std::env::temp_dir();
        let spec = CommandSpec::new("covrun-no-such-runner", Vec::<String>::new());
        let err = run(&spec, &[], &[], &cwd).unwrap_err();
        assert!(matches!(err, CovrunError::WorkloadExecution { .. }), "{err}");
    }

    #[test]
    fn test_run_killed_by_signal_is_fatal() {
        let cwd = std::env::temp_dir();
        let err = run(&sh("kill -9 $$"), &[], &[], &cwd).unwrap_err();
        assert!(matches!(err, CovrunError::WorkloadExecution { .. }), "{err}");
    }

    #[test]
    fn test_unit_scope_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        // `sh -c script name args...` binds the appended args to $0, $1, ...
        let script = format!("echo \"$0 $*\" > {}", out.display());
        run_unit_tests(&sh(&script), &[], dir.path(), Some("modkit-db")).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "--package modkit-db");

        run_unit_tests(&sh(&script), &[], dir.path(), None).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "--workspace");
    }

    #[test]
    fn test_integration_exports_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!("echo \"$E2E_BASE_URL $0 $1\" > {}", out.display());
        run_integration_tests(
            &sh(&script),
            "E2E_BASE_URL",
            "http://127.0.0.1:8087",
            &[],
            dir.path(),
            Some("test_users"),
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            "http://127.0.0.1:8087 -k test_users"
        );
    }

    #[test]
    fn test_ensure_tool() {
        assert!(ensure_tool("sh", &["-c", "exit 0"], "install a shell").is_ok());
        let err = ensure_tool("covrun-no-such-tool", &["--version"], "cargo install it").unwrap_err();
        assert!(err.to_string().contains("covrun-no-such-tool is not installed"));
        assert!(err.to_string().contains("cargo install it"));
    }
}
