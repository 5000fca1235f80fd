//! mfs-consolidate
//!
//! Walks a directory of a mergerfs pool and, for every directory that is
//! small enough, moves its files onto the branch with the most free space.
//! Commands are printed; `--execute` also runs them.

use anyhow::Context;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use mfsbalance_core::{MergedMount, MfsError, XattrProvider};
use mfsbalance_rebalancer::{
    ActionEmitter, CapacityLedger, ConsolidateConfig, ConsolidationPlanner, HardlinkIndex,
    IndexError, PlannerError,
};

#[derive(Parser)]
#[command(name = "mfs-consolidate")]
#[command(about = "Consolidate files of mergerfs directories onto the branch with the most free space")]
#[command(version)]
struct Cli {
    /// Starting directory inside the merged mount
    dir: Option<PathBuf>,

    /// Skip directories with more than N files [default: 256]
    #[arg(short = 'm', long, value_name = "N")]
    max_files: Option<usize>,

    /// Skip directories whose files sum to SIZE or more (K/M/G/T) [default: 16G]
    #[arg(short = 'M', long, value_name = "SIZE")]
    max_size: Option<String>,

    /// Only consolidate directories matching GLOB (repeatable) [default: *]
    #[arg(short = 'I', long = "include-path", value_name = "GLOB")]
    include: Vec<String>,

    /// Skip directories matching GLOB (repeatable)
    #[arg(short = 'E', long = "exclude-path", value_name = "GLOB")]
    exclude: Vec<String>,

    /// Relink and delete hardlink siblings of moved files
    #[arg(short = 'H', long)]
    move_hardlinks: bool,

    /// Run the commands instead of only printing them
    #[arg(short, long)]
    execute: bool,

    /// Configuration file (TOML)
    #[arg(short, long, env = "MFS_CONSOLIDATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Layer CLI flags over file and environment settings
    fn load_config(&self) -> anyhow::Result<ConsolidateConfig> {
        let config = match &self.config {
            Some(path) => ConsolidateConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ConsolidateConfig::default(),
        };
        let mut config = config.with_env_overrides();

        if let Some(max_files) = self.max_files {
            config.max_files = max_files;
        }
        if let Some(max_size) = &self.max_size {
            config.max_size = max_size.clone();
        }
        if !self.include.is_empty() {
            config.include = self.include.clone();
        }
        if !self.exclude.is_empty() {
            config.exclude.extend(self.exclude.iter().cloned());
        }
        config.move_hardlinks |= self.move_hardlinks;
        config.execute |= self.execute;

        config.validate()?;
        Ok(config)
    }
}

/// `directives` (as in `RUST_LOG`) win; the verbosity level is the fallback
fn env_filter(verbose: bool, directives: &str) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives)
}

fn init_tracing(verbose: bool) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, &directives))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli, dir: PathBuf) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;

    let dir = dir
        .canonicalize()
        .with_context(|| format!("resolving {}", dir.display()))?;

    let provider = XattrProvider::new();
    let mount = match MergedMount::resolve(&provider, &dir) {
        Ok(mount) => mount,
        Err(MfsError::NotAMergedMount(path)) => {
            eprintln!("{} is not a mergerfs mount", path.display());
            return Ok(ExitCode::from(1));
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        dir = %dir.display(),
        mount = %mount.mount_point().display(),
        branches = ?mount.branches,
        execute = config.execute,
        "Starting consolidation"
    );

    let ledger = CapacityLedger::measure(&mount.branches)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing interrupt handler")?;

    let index = if config.move_hardlinks {
        match HardlinkIndex::build(&mount.branches, &interrupted) {
            Ok(index) => Some(index),
            Err(IndexError::Interrupted) => {
                info!("Interrupted during hardlink scan, stopping");
                return Ok(ExitCode::SUCCESS);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("building hardlink index")),
        }
    } else {
        None
    };

    let mut planner = ConsolidationPlanner::new(&provider, config.build_filter()?, ledger)?
        .with_interrupt(interrupted);
    if let Some(index) = index {
        planner = planner.with_hardlinks(index);
    }

    let mut emitter = ActionEmitter::stdout(config.execute, config.transfer_command());
    match planner.run(&dir, &mut emitter) {
        Ok(summary) => {
            info!(summary = %summary.summary(), "Consolidation finished");
            if summary.failures > 0 {
                warn!(failures = summary.failures, "Some actions failed");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(PlannerError::Interrupted) => {
            info!(summary = %planner.summary().summary(), "Interrupted, stopping");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(dir) = cli.dir.clone() else {
        // Help on a closed stdout is not worth failing over
        let _ = Cli::command().print_help();
        return ExitCode::SUCCESS;
    };

    match run(&cli, dir) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Consolidation failed");
            ExitCode::FAILURE
        }
    }
}
