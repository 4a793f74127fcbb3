use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use covrun::cli::{self, ModeArg};
use covrun::driver::{Mode, RunOptions, ToolGate};
use covrun::export::LlvmCov;
use covrun::{logging, report};

/// covrun: collect code coverage from unit tests and an instrumented server.
#[derive(Parser)]
#[command(name = "covrun", version, about)]
struct Cli {
    /// Orchestrator settings file (YAML). Defaults apply when omitted.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ReportArgs {
    /// Coverage threshold percentage (default from settings, 70).
    #[arg(long)]
    threshold: Option<u64>,

    /// Add untested project files with zero coverage.
    #[arg(long)]
    expand_to_project: bool,

    /// Exit non-zero when total line coverage is below the threshold.
    #[arg(long)]
    fail_under: bool,
}

#[derive(Args)]
struct CollectArgs {
    /// Config file (exported to unit tests, passed to the server).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Package for unit tests, test expression for integration tests.
    #[arg(long)]
    filter: Option<String>,

    /// Skip cleaning and test execution; report on existing data.
    #[arg(long)]
    skip_build: bool,

    /// Skip the prerequisite check.
    #[arg(long)]
    skip_env_check: bool,

    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect coverage from unit tests.
    Unit(CollectArgs),

    /// Collect coverage from integration tests against a local server.
    E2eLocal(CollectArgs),

    /// Collect unit and integration coverage into one report.
    Combined(CollectArgs),

    /// Regenerate reports from existing coverage data.
    Report {
        /// Which mode's output directory to write.
        #[arg(long, value_enum, default_value = "unit")]
        mode: ModeArg,

        #[command(flatten)]
        report: ReportArgs,
    },
}

fn run_options(mode: Mode, args: &CollectArgs) -> RunOptions {
    let mut opts = RunOptions::new(mode);
    opts.config = args.config.clone();
    opts.filter = args.filter.clone();
    opts.skip_build = args.skip_build;
    opts.skip_env_check = args.skip_env_check;
    apply_report_args(&mut opts, &args.report);
    opts
}

fn apply_report_args(opts: &mut RunOptions, args: &ReportArgs) {
    opts.threshold = args.threshold;
    if args.expand_to_project {
        opts.expand_to_project = Some(true);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, std::io::stderr().is_terminal());

    let (mut opts, fail_under) = match &cli.command {
        Commands::Unit(args) => (run_options(Mode::Unit, args), args.report.fail_under),
        Commands::E2eLocal(args) => (run_options(Mode::Integration, args), args.report.fail_under),
        Commands::Combined(args) => (run_options(Mode::Combined, args), args.report.fail_under),
        Commands::Report { mode, report } => {
            let mut opts = RunOptions::new((*mode).into());
            opts.skip_build = true;
            opts.skip_env_check = true;
            apply_report_args(&mut opts, report);
            (opts, report.fail_under)
        }
    };
    opts.color = report::detect_color();

    let settings = cli::load_settings(cli.settings.as_deref())?;
    let tool = LlvmCov::new(settings.project_root.clone());
    let gate = ToolGate::default();

    let summary = cli::cmd_coverage(settings, &tool, &gate, &opts)?;
    print!("{}", cli::render_summary(&summary));

    if fail_under {
        if let Some(msg) = cli::threshold_failure(&summary) {
            anyhow::bail!(msg);
        }
    }
    Ok(())
}
