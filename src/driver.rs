//! Orchestration of one coverage run.
//!
//! A run walks `Idle -> Cleaning -> Collecting -> Aggregating -> Reporting
//! -> Done`. Only a fatal error while collecting ends in `Failed`; failing
//! tests are recorded as warnings and the run still produces a report.
//! A server started during collection is owned by the driver and is
//! always stopped before collection returns, whatever happened.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::aggregate::Aggregator;
use crate::config::{BindAddr, Settings};
use crate::error::{CovrunError, Result};
use crate::export::{self, ArtifactPaths, CoverageTool, ExportFormat};
use crate::model::CoverageReport;
use crate::parsers::{llvm_cov::LlvmCovParser, Parser};
use crate::probe::ReadinessProbe;
use crate::report::{self, TableOptions};
use crate::supervisor::{self, ServerLaunch, ServerSession};
use crate::workload::{self, WorkloadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Unit tests only.
    Unit,
    /// Integration tests against a locally started instrumented server.
    Integration,
    /// Unit tests, then integration tests, into one dataset.
    Combined,
}

impl Mode {
    /// Name used for the output directory and in messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unit => "unit",
            Mode::Integration => "e2e-local",
            Mode::Combined => "combined",
        }
    }

    pub fn runs_server(&self) -> bool {
        matches!(self, Mode::Integration | Mode::Combined)
    }

    /// Whether untested project files are added to the report by default.
    pub fn expands_by_default(&self) -> bool {
        matches!(self, Mode::Integration)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Cleaning,
    Collecting,
    Aggregating,
    Reporting,
    Done,
    Failed,
}

/// A degraded condition that did not stop the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A workload ran and some of its tests failed.
    TestFailures { workload: &'static str, code: i32 },
    /// No coverage data was available to aggregate; the report shows zero.
    AggregationInputMissing { reason: String },
    /// The server's port still accepted connections after shutdown.
    PortStillOpen { port: u16 },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::TestFailures { workload, code } => write!(
                f,
                "some {workload} tests failed (exit code {code}), but coverage was still collected"
            ),
            Warning::AggregationInputMissing { reason } => {
                write!(f, "no coverage data to aggregate, reporting zero coverage: {reason}")
            }
            Warning::PortStillOpen { port } => {
                write!(f, "port {port} still accepts connections after server shutdown")
            }
        }
    }
}

/// Prerequisite check run before anything else.
pub trait EnvironmentGate {
    fn environment_ready(&self, mode: Mode) -> bool;
}

/// One tool that must be installed.
#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub program: String,
    pub version_args: Vec<String>,
    pub hint: String,
    /// Only required by modes that run a server.
    pub server_only: bool,
}

/// Checks that the required tools answer their version command.
#[derive(Debug, Clone)]
pub struct ToolGate {
    checks: Vec<ToolCheck>,
}

impl ToolGate {
    pub fn new(checks: Vec<ToolCheck>) -> Self {
        Self { checks }
    }
}

impl Default for ToolGate {
    fn default() -> Self {
        let check = |program: &str, args: &[&str], hint: &str, server_only| ToolCheck {
            program: program.to_string(),
            version_args: args.iter().map(|a| (*a).to_string()).collect(),
            hint: hint.to_string(),
            server_only,
        };
        Self::new(vec![
            check(
                "cargo",
                &["llvm-cov", "--version"],
                "cargo install cargo-llvm-cov",
                false,
            ),
            check(
                "python3",
                &["-m", "pytest", "--version"],
                "pip install pytest",
                true,
            ),
        ])
    }
}

impl EnvironmentGate for ToolGate {
    fn environment_ready(&self, mode: Mode) -> bool {
        let mut ready = true;
        for check in self.checks.iter().filter(|c| mode.runs_server() || !c.server_only) {
            let args: Vec<&str> = check.version_args.iter().map(String::as_str).collect();
            if let Err(e) = workload::ensure_tool(&check.program, &args, &check.hint) {
                tracing::error!("{e}");
                ready = false;
            }
        }
        ready
    }
}

/// Per-run choices, usually from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    /// Server config (integration) or config exported to unit tests.
    pub config: Option<PathBuf>,
    /// Package for unit tests, test expression for integration tests.
    pub filter: Option<String>,
    /// Reuse existing instrumentation data; skip cleaning and collection.
    pub skip_build: bool,
    pub threshold: Option<u64>,
    /// Overrides the mode's expand-to-project default.
    pub expand_to_project: Option<bool>,
    /// Color the console table.
    pub color: bool,
    pub skip_env_check: bool,
}

impl RunOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            config: None,
            filter: None,
            skip_build: false,
            threshold: None,
            expand_to_project: None,
            color: false,
            skip_env_check: false,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub mode: Mode,
    pub report: CoverageReport,
    /// The table as printed to the console.
    pub table: String,
    pub threshold: u64,
    pub paths: ArtifactPaths,
    pub warnings: Vec<Warning>,
    pub phases: Vec<Phase>,
    /// `*.profraw` files found after the server stopped.
    pub profile_files: Option<usize>,
}

impl RunSummary {
    /// Total line coverage reaches the threshold.
    pub fn meets_threshold(&self) -> bool {
        self.report.total.lines.percent() >= self.threshold
    }
}

pub struct Driver<'a> {
    settings: Settings,
    tool: &'a dyn CoverageTool,
    gate: &'a dyn EnvironmentGate,
    session: Option<ServerSession>,
    phases: Vec<Phase>,
    warnings: Vec<Warning>,
    profile_files: Option<usize>,
}

impl<'a> Driver<'a> {
    pub fn new(settings: Settings, tool: &'a dyn CoverageTool, gate: &'a dyn EnvironmentGate) -> Self {
        Self {
            settings,
            tool,
            gate,
            session: None,
            phases: vec![Phase::Idle],
            warnings: Vec::new(),
            profile_files: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Whether a server session is currently owned.
    pub fn server_running(&self) -> bool {
        self.session.is_some()
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase(), to = ?phase, "phase transition");
        self.phases.push(phase);
    }

    fn warn(&mut self, warning: Warning) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Run one mode end to end.
    pub fn run(&mut self, opts: &RunOptions) -> Result<RunSummary> {
        let mode = opts.mode;
        if opts.skip_env_check {
            tracing::warn!("skipping environment validation");
        } else {
            tracing::info!(%mode, "validating test environment");
            if !self.gate.environment_ready(mode) {
                return Err(CovrunError::EnvironmentNotReady {
                    mode: mode.to_string(),
                });
            }
        }

        // llvm-cov reports canonical paths, and children run from the root.
        self.settings.project_root = std::fs::canonicalize(&self.settings.project_root)?;
        let output_dir = self.settings.resolve(&self.settings.output_root).join(mode.as_str());
        let paths = ArtifactPaths::new(output_dir);

        if opts.skip_build {
            std::fs::create_dir_all(&paths.dir)?;
            tracing::info!("skipping test execution, using existing coverage data");
        } else {
            // The server config must be valid before existing data is wiped.
            let server = if mode.runs_server() {
                Some(self.server_config(opts.config.as_deref())?)
            } else {
                None
            };
            std::fs::create_dir_all(&paths.dir)?;

            self.enter(Phase::Cleaning);
            tracing::info!("cleaning previous coverage data");
            self.tool.clean()?;

            self.enter(Phase::Collecting);
            if let Err(e) = self.collect(opts, server.as_ref(), &paths) {
                self.enter(Phase::Failed);
                tracing::error!(%mode, "coverage collection failed: {e}");
                return Err(e);
            }
        }

        self.enter(Phase::Aggregating);
        let (report, input_missing) = self.aggregate(opts, &paths)?;

        self.enter(Phase::Reporting);
        let threshold = opts.threshold.unwrap_or(self.settings.threshold);
        let table = self.write_reports(&report, &paths, threshold, opts.color, input_missing)?;

        self.enter(Phase::Done);
        tracing::info!(dir = %paths.dir.display(), "coverage reports generated");

        Ok(RunSummary {
            mode,
            report,
            table,
            threshold,
            paths,
            warnings: std::mem::take(&mut self.warnings),
            phases: self.phases.clone(),
            profile_files: self.profile_files,
        })
    }

    /// Resolve the server config and read its bind address.
    fn server_config(&self, config: Option<&Path>) -> Result<(PathBuf, BindAddr)> {
        let config = self
            .settings
            .resolve(config.unwrap_or(&self.settings.server_config));
        let bind = BindAddr::from_server_config(&config)?;
        tracing::debug!(bind_host = %bind.host, port = bind.port, "server bind address");
        Ok((config, bind))
    }

    fn collect(
        &mut self,
        opts: &RunOptions,
        server: Option<&(PathBuf, BindAddr)>,
        paths: &ArtifactPaths,
    ) -> Result<()> {
        match (opts.mode, server) {
            (Mode::Unit, _) => self.collect_unit(opts.config.as_deref(), opts.filter.as_deref()),
            (Mode::Integration, Some((config, bind))) => {
                self.collect_integration(config, bind, opts.filter.as_deref(), paths)
            }
            (Mode::Combined, Some((config, bind))) => {
                self.collect_unit(Some(config.as_path()), None)?;
                self.collect_integration(config, bind, opts.filter.as_deref(), paths)
            }
            (mode, None) => Err(CovrunError::Config {
                path: self.settings.server_config.clone(),
                reason: format!("{mode} coverage needs a server config"),
            }),
        }
    }

    fn collect_unit(&mut self, config: Option<&Path>, filter: Option<&str>) -> Result<()> {
        tracing::info!("collecting unit test coverage");
        let mut env = Vec::new();
        if let Some(config) = config {
            let config = self.settings.resolve(config);
            tracing::info!(config = %config.display(), "using config");
            env.push((
                self.settings.config_env_var.clone(),
                config.to_string_lossy().into_owned(),
            ));
        }
        let outcome = workload::run_unit_tests(
            &self.settings.unit_tests,
            &env,
            &self.settings.project_root,
            filter,
        )?;
        self.record_outcome("unit", outcome);
        Ok(())
    }

    fn collect_integration(
        &mut self,
        config: &Path,
        bind: &BindAddr,
        filter: Option<&str>,
        paths: &ArtifactPaths,
    ) -> Result<()> {
        tracing::info!("collecting integration test coverage");
        let launch = ServerLaunch {
            command: self.settings.server_command(config),
            env: vec![(
                "LLVM_PROFILE_FILE".to_string(),
                self.settings
                    .resolve(Path::new(&self.settings.profile_file_pattern))
                    .to_string_lossy()
                    .into_owned(),
            )],
            cwd: self.settings.project_root.clone(),
            log_path: paths.server_log.clone(),
            host: self.settings.server_host.clone(),
            port: bind.port,
            config_path: Some(config.to_path_buf()),
        };
        self.session = Some(supervisor::start(&launch)?);

        let exercised = self.exercise_server(filter);
        let stopped = self.stop_server();
        self.count_profiles();
        exercised?;
        stopped
    }

    fn exercise_server(&mut self, filter: Option<&str>) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let probe = ReadinessProbe::new(session.host(), session.port())
            .with_timeout(self.settings.readiness_timeout())
            .with_health_paths(self.settings.health_paths.as_slice())
            .with_log(session.log_path(), self.settings.log_tail_lines);
        if let Err(e) = probe.wait_ready() {
            session.mark_failed();
            return Err(e.into());
        }
        session.mark_ready();
        let base_url = session.base_url();

        let outcome = workload::run_integration_tests(
            &self.settings.integration_tests,
            &self.settings.base_url_env_var,
            &base_url,
            &[],
            &self.settings.project_root,
            filter,
        )?;
        self.record_outcome("integration", outcome);
        Ok(())
    }

    fn stop_server(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let outcome = session.stop(self.settings.drain_timeout())?;
        if !outcome.port_released {
            self.warn(Warning::PortStillOpen {
                port: session.port(),
            });
        }
        Ok(())
    }

    fn count_profiles(&mut self) {
        let dir = self.settings.resolve(&self.settings.profile_dir);
        let pattern = dir.join("**").join("*.profraw");
        let count = match glob::glob(&pattern.to_string_lossy()) {
            Ok(entries) => entries.filter_map(std::result::Result::ok).count(),
            Err(e) => {
                tracing::debug!(error = %e, "bad profile glob");
                0
            }
        };
        tracing::info!(count, dir = %dir.display(), "profile files found");
        self.profile_files = Some(count);
    }

    fn record_outcome(&mut self, workload: &'static str, outcome: WorkloadOutcome) {
        match outcome {
            WorkloadOutcome::Passed => tracing::info!("{workload} tests passed"),
            WorkloadOutcome::TestsFailed { code } => {
                self.warn(Warning::TestFailures { workload, code });
            }
        }
    }

    /// Export the structured dump and aggregate it. With `skip_build`, a
    /// failed export means there is no prior data; that degrades to an
    /// empty report. Returns the report and whether input was missing.
    fn aggregate(&mut self, opts: &RunOptions, paths: &ArtifactPaths) -> Result<(CoverageReport, bool)> {
        let records = match export::emit(self.tool, ExportFormat::Json, paths) {
            Ok(bytes) => LlvmCovParser.parse(&bytes)?,
            Err(e) if opts.skip_build => {
                self.warn(Warning::AggregationInputMissing {
                    reason: e.to_string(),
                });
                return Ok((self.empty_report(opts)?, true));
            }
            Err(e) => return Err(e),
        };

        let mut agg = Aggregator::new(&self.settings.project_root, self.settings.layout.clone());
        agg.add_records(&records);
        if opts.expand_to_project.unwrap_or(opts.mode.expands_by_default()) {
            agg.expand_to_project()?;
        }
        Ok((agg.finish(), false))
    }

    fn empty_report(&self, opts: &RunOptions) -> Result<CoverageReport> {
        let mut agg = Aggregator::new(&self.settings.project_root, self.settings.layout.clone());
        if opts.expand_to_project.unwrap_or(opts.mode.expands_by_default()) {
            agg.expand_to_project()?;
        }
        Ok(agg.finish())
    }

    /// Write the remaining artifacts and the table. The file copy of the
    /// table is never colored.
    fn write_reports(
        &self,
        report: &CoverageReport,
        paths: &ArtifactPaths,
        threshold: u64,
        color: bool,
        input_missing: bool,
    ) -> Result<String> {
        if input_missing {
            tracing::debug!("no coverage data, skipping tool reports");
        } else {
            tracing::info!("generating HTML report");
            export::emit_html(self.tool, paths)?;
            export::emit(self.tool, ExportFormat::Summary, paths)?;
            export::emit(self.tool, ExportFormat::Lcov, paths)?;
        }

        let plain = report::format_report(report, &TableOptions { threshold, color: false });
        export::write_atomic(&paths.table, plain.as_bytes())?;
        tracing::info!(path = %paths.table.display(), "coverage table written");

        if color {
            Ok(report::format_report(report, &TableOptions { threshold, color: true }))
        } else {
            Ok(plain)
        }
    }
}
