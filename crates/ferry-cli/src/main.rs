//! Ferry CLI - batch model transformation through a pivot representation

mod config;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use config::{Config, Defaults};
use ferry_core::{
    BatchDriver, BatchError, BatchOptions, BatchSummary, CollectorRegistry, DEFAULT_TIMEOUT,
    EventChannel, ExclusionError, ExclusionList, FileReport, Mode, PipelinePlan, PipelineScheduler,
    PlanError, PluginRegistry, ResultLedger, STUCK_WORKER_EXIT_CODE, SchedulerOptions, Strategy,
    StuckWorkerPolicy, collect_files,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Process exit codes.
mod exit {
    pub const SUCCESS: i32 = 0;
    pub const SAME_TYPE: i32 = 1;
    pub const INVALID_SOURCE: i32 = 2;
    pub const INVALID_TARGET: i32 = 3;
    pub const INVALID_EXCLUSION: i32 = 4;
    pub const INIT_FAILURE: i32 = 5;
    pub const STRICT_ABORT: i32 = 6;
}

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Batch model transformation through a pivot representation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/ferry/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform a model file or a directory of model files
    Transform(TransformArgs),

    /// List registered plugin types
    Plugins,

    /// List available benchmark collectors
    Collectors,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man page
    Manpage,
}

#[derive(Args)]
struct TransformArgs {
    /// Source file or directory
    source: PathBuf,
    /// Output directory (created if missing)
    target: PathBuf,
    /// Type of the source models
    #[arg(short = 's', long = "source-type")]
    source_type: String,
    /// Type to transform into
    #[arg(short = 't', long = "target-type")]
    target_type: String,
    /// Comma-separated collector ids to benchmark with
    #[arg(long, value_delimiter = ',')]
    collectors: Vec<String>,
    /// CSV file receiving one row per processed file
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// File listing names to skip, one per line
    #[arg(long)]
    exclusion_file: Option<PathBuf>,
    /// Strategy handed to every transformer (one-way, round-trip)
    #[arg(long, value_parser = parse_strategy, default_value = "one-way")]
    strategy: Strategy,
    /// Transform to the target type and back again
    #[arg(long, conflicts_with = "reverse_only")]
    round_trip: bool,
    /// Like --round-trip, benchmarking only the final step
    #[arg(long)]
    reverse_only: bool,
    /// Do not write output files
    #[arg(long)]
    skip_serialization: bool,
    /// Abort on the first file that does not succeed
    #[arg(long)]
    strict: bool,
    /// Per-phase timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Files processed in parallel (requires the `parallel` feature)
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,
    /// What to do when a worker ignores cancellation (abort, continue)
    #[arg(long, value_parser = parse_stuck_worker_policy)]
    on_stuck_worker: Option<StuckWorkerPolicy>,
}

impl TransformArgs {
    fn mode(&self) -> Mode {
        if self.reverse_only {
            Mode::ReverseOnly
        } else if self.round_trip {
            Mode::RoundTrip
        } else {
            Mode::OneWay
        }
    }
}

/// Parse --strategy argument.
fn parse_strategy(s: &str) -> Result<Strategy, String> {
    match s.to_lowercase().as_str() {
        "one-way" | "oneway" => Ok(Strategy::OneWay),
        "round-trip" | "roundtrip" => Ok(Strategy::RoundTrip),
        _ => Err(format!(
            "Invalid strategy '{}'. Use: one-way, round-trip",
            s
        )),
    }
}

/// Parse --on-stuck-worker argument.
fn parse_stuck_worker_policy(s: &str) -> Result<StuckWorkerPolicy, String> {
    match s.to_lowercase().as_str() {
        "abort" => Ok(StuckWorkerPolicy::Abort),
        "continue" => Ok(StuckWorkerPolicy::Continue),
        _ => Err(format!("Invalid policy '{}'. Use: abort, continue", s)),
    }
}

/// A source or target path that cannot be used.
#[derive(Debug, thiserror::Error)]
enum PathError {
    #[error("source path {} is neither a file nor a directory", .0.display())]
    Source(PathBuf),
    #[error("target path {} is not a directory", .0.display())]
    Target(PathBuf),
    #[error("cannot create target directory {}: {source}", path.display())]
    CreateTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Output verbosity level.
#[derive(Clone, Copy)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    /// Default tracing level when RUST_LOG is unset.
    fn log_level(self) -> tracing::Level {
        match self {
            Verbosity::Quiet => tracing::Level::ERROR,
            Verbosity::Normal => tracing::Level::WARN,
            Verbosity::Verbose => tracing::Level::DEBUG,
        }
    }

    fn info(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            println!("[debug] {msg}");
        }
    }

    fn result(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }
}

fn init_logging(v: Verbosity) {
    let filter = EnvFilter::builder()
        .with_default_directive(v.log_level().into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from_path(path),
        None => Config::load(),
    };

    // Apply config defaults, CLI flags override
    let verbose = cli.verbose || config.defaults.verbose;
    let quiet = cli.quiet || config.defaults.quiet;
    let verbosity = Verbosity::from_flags(verbose, quiet);
    init_logging(verbosity);

    let code = match run(cli.command, &config.defaults, verbosity) {
        Ok(()) => exit::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run(command: Commands, defaults: &Defaults, v: Verbosity) -> Result<()> {
    match command {
        Commands::Transform(args) => cmd_transform(args, defaults, v),
        Commands::Plugins => cmd_plugins(v),
        Commands::Collectors => cmd_collectors(v),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ferry", &mut std::io::stdout());
            Ok(())
        }
        Commands::Manpage => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut std::io::stdout())?;
            Ok(())
        }
    }
}

/// Map an error onto the process exit code, looking through its context.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<PathError>() {
            return match e {
                PathError::Source(_) => exit::INVALID_SOURCE,
                PathError::Target(_) | PathError::CreateTarget { .. } => exit::INVALID_TARGET,
            };
        }
        if let Some(e) = cause.downcast_ref::<PlanError>() {
            return match e {
                PlanError::SameType(_) => exit::SAME_TYPE,
                _ => exit::INIT_FAILURE,
            };
        }
        if let Some(e) = cause.downcast_ref::<BatchError>() {
            match e {
                BatchError::InvalidSource(_) => return exit::INVALID_SOURCE,
                BatchError::Strict { .. } => return exit::STRICT_ABORT,
                BatchError::StuckWorker { .. } => return STUCK_WORKER_EXIT_CODE,
                _ => {}
            }
        }
        if cause.is::<ExclusionError>() {
            return exit::INVALID_EXCLUSION;
        }
    }
    exit::INIT_FAILURE
}

fn registry() -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    ferry_pivot::register_all(&mut registry).context("Failed to register plugins")?;
    Ok(registry)
}

fn cmd_plugins(v: Verbosity) -> Result<()> {
    let registry = registry()?;
    v.info("Available plugin types:\n");

    for plugin in registry.plugins() {
        let marker = if plugin.is_pivot() { " (pivot)" } else { "" };
        println!("  {}{}", plugin.name(), marker);
        println!("    reads:  {:?}", plugin.deserializer().file_extensions());
        println!("    writes: {}", plugin.serializer().file_extension());
        if let Some(transformer) = plugin.transformer() {
            v.debug(&format!("transformer: {}", transformer.name()));
        }
    }

    v.info(&format!("\nTotal: {} plugins", registry.len()));
    Ok(())
}

fn cmd_collectors(v: Verbosity) -> Result<()> {
    let collectors = CollectorRegistry::with_builtins();
    v.info("Available collectors:\n");

    for id in collectors.ids() {
        let columns = collectors.columns(id).unwrap_or_default();
        println!("  {:<20} {}", id, columns.join(", "));
    }
    Ok(())
}

fn cmd_transform(args: TransformArgs, defaults: &Defaults, v: Verbosity) -> Result<()> {
    if args.source_type.eq_ignore_ascii_case(&args.target_type) {
        return Err(PlanError::SameType(args.source_type).into());
    }
    if !(args.source.is_file() || args.source.is_dir()) {
        return Err(PathError::Source(args.source).into());
    }
    if !args.target.is_dir() {
        if args.target.exists() {
            return Err(PathError::Target(args.target).into());
        }
        std::fs::create_dir_all(&args.target).map_err(|source| PathError::CreateTarget {
            path: args.target.clone(),
            source,
        })?;
    }

    let exclusions = match args.exclusion_file.as_ref().or(defaults.exclusion_file.as_ref()) {
        Some(path) => Some(Arc::new(ExclusionList::load(path).with_context(|| {
            format!("Failed to load exclusion file {}", path.display())
        })?)),
        None => None,
    };

    // Initialization
    let registry = registry()?;
    let mode = args.mode();
    let plan = PipelinePlan::build(
        &registry,
        &args.source_type,
        &args.target_type,
        mode,
        args.strategy,
    )?;
    v.debug(&format!(
        "plan: {} -> {} ({:?}, {} steps: {:?})",
        plan.source(),
        plan.target(),
        mode,
        plan.len(),
        plan.directions()
    ));

    let ids = if args.collectors.is_empty() {
        &defaults.collectors
    } else {
        &args.collectors
    };
    let collectors = CollectorRegistry::with_builtins().select(ids)?;

    let timeout = args
        .timeout
        .or(defaults.timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    let options = SchedulerOptions::default()
        .with_timeout(timeout)
        .with_serialize(!args.skip_serialization);

    let mut scheduler = PipelineScheduler::new(Arc::new(plan), Arc::new(EventChannel::new()))
        .with_options(options);
    if let Some(path) = args.ledger.as_ref().or(defaults.ledger.as_ref()) {
        let ledger = ResultLedger::open(path, &collectors.columns())
            .with_context(|| format!("Failed to open ledger {}", path.display()))?;
        scheduler = scheduler.with_ledger(Arc::new(ledger));
    }
    if let Some(exclusions) = exclusions {
        scheduler = scheduler.with_exclusions(exclusions);
    }
    let scheduler = scheduler.with_collectors(collectors);

    let mut batch = BatchOptions::default()
        .with_strict(args.strict || defaults.strict)
        .with_stuck_worker_policy(
            args.on_stuck_worker
                .or(defaults.on_stuck_worker)
                .unwrap_or_default(),
        );
    if let Some(jobs) = args.parallelism.or(defaults.parallelism) {
        batch = batch.with_parallelism(jobs);
    }
    let driver = BatchDriver::new(Arc::new(scheduler), batch);

    // Transformation
    let files = collect_files(&args.source, &driver.scheduler().plan().source_extensions())?;
    if files.is_empty() {
        v.info(&format!(
            "No {} files found in {}",
            args.source_type,
            args.source.display()
        ));
        return Ok(());
    }

    let pb = if args.source.is_dir() && !matches!(v, Verbosity::Quiet) {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        Some(pb)
    } else {
        None
    };

    let result = driver.run_files(&files, &args.target, |report| {
        if let Some(ref pb) = pb {
            pb.set_message(report.file_name.clone());
            pb.inc(1);
        }
    });

    if let Some(pb) = pb {
        pb.finish_with_message("done");
    }

    match result {
        Ok(summary) => {
            print_summary(&summary, v);
            Ok(())
        }
        Err(err) => {
            if let Some(summary) = err.summary() {
                print_summary(summary, v);
            }
            Err(err.into())
        }
    }
}

fn print_summary(summary: &BatchSummary, v: Verbosity) {
    for report in &summary.reports {
        v.debug(&describe(report));
    }
    for file in summary.stuck() {
        v.info(&format!("Worker for {file} did not stop after its deadline"));
    }
    v.result(&summary.to_string());
}

fn describe(report: &FileReport) -> String {
    let mut line = format!("{}: {}", report.file_name, report.outcome);
    for (column, value) in &report.results {
        line.push_str(&format!(" {column}={value}"));
    }
    if let Some(ref error) = report.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}
