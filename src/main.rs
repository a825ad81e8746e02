use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use r2r::config::{self, HarnessConfig, BINARY_ENV, DEFAULT_CORPUS_DIR, DEFAULT_DB};
use r2r::discover::DialectMap;
use r2r::engine::ScriptMode;
use r2r::harness::Harness;
use r2r::normalize::Normalizer;
use r2r::record::Dialect;
use r2r::schedule::DEFAULT_JOBS;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{warn, Level};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "radare2 regression test runner",
    long_about = None,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the regression suite (default)
    Run(RunArgs),
    /// Rewrite test files into the canonical grammar without running them
    Normalize {
        /// Files or directories to rewrite
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Also put a blank line after every RUN
        #[arg(long, default_value_t = false)]
        format: bool,
        /// Report files that need a rewrite without touching them
        #[arg(long, default_value_t = false)]
        check: bool,
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only run tests whose file path contains this filter
    filter: Option<String>,
    /// Test database directory
    #[arg(long, default_value = DEFAULT_DB)]
    db: PathBuf,
    /// Directory of fuzzed binaries to smoke-test
    #[arg(long, default_value = DEFAULT_CORPUS_DIR)]
    corpus: PathBuf,
    /// Only run tests of this dialect
    #[arg(long, value_enum)]
    dialect: Option<Dialect>,
    /// Print one JSON document instead of status lines
    #[arg(short, long, default_value_t = false)]
    json: bool,
    /// List tests without running them
    #[arg(short, long, default_value_t = false)]
    list: bool,
    /// Walk through regressions after the run
    #[arg(short, long, default_value_t = false)]
    interactive: bool,
    /// Drop the BROKEN mark of tests that pass again
    #[arg(short, long, default_value_t = false)]
    unmark_fixed: bool,
    /// Pass scripts with -c instead of a temporary file
    #[arg(short = 'c', long, default_value_t = false)]
    inline: bool,
    #[arg(long, default_value_t = DEFAULT_JOBS)]
    jobs: usize,
    /// Seconds before a fuzzed binary is considered hung
    #[arg(long, default_value_t = 120)]
    timeout: u64,
    /// radare2 binary (defaults to $R2R_BIN, then radare2 on PATH)
    #[arg(long)]
    r2: Option<PathBuf>,
    /// Debug logging and failure details for broken tests
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let code = match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => {
            init_logging(args.verbose);
            run(args)?
        }
        Commands::Normalize {
            paths,
            format,
            check,
            verbose,
        } => {
            init_logging(verbose);
            normalize(&paths, format, check)?
        }
    };
    process::exit(code);
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn run(args: RunArgs) -> Result<i32> {
    let binary = config::resolve_binary(args.r2.as_deref(), env::var(BINARY_ENV).ok())?;
    let config = HarnessConfig {
        binary,
        jobs: args.jobs,
        corpus_timeout: Duration::from_secs(args.timeout),
        script_mode: if args.inline {
            ScriptMode::Inline
        } else {
            ScriptMode::File
        },
        quiet_ok: config::quiet_ok_from_env(),
        db: args.db,
        corpus_dir: args.corpus,
        filter: args.filter,
        dialect: args.dialect,
        json: args.json,
        list: args.list,
        interactive: args.interactive,
        unmark_fixed: args.unmark_fixed,
        verbose: args.verbose,
        ..HarnessConfig::default()
    };
    let harness = Harness::new(config);
    let stdin = io::stdin();
    harness.execute(&[], io::stdout(), stdin.lock())
}

// --------------------- Normalize -------------------------------------------
fn normalize(paths: &[PathBuf], format: bool, check: bool) -> Result<i32> {
    let normalizer = Normalizer::new(format);
    let roles = DialectMap::default();
    let mut stale = 0usize;
    let mut failed = 0usize;
    for root in paths {
        if !root.exists() {
            bail!("{} does not exist", root.display());
        }
        for file in command_files(root, &roles) {
            match normalizer.normalize_file(&file, !check) {
                Ok(true) if check => {
                    stale += 1;
                    println!("[FIX ] {}", file.display());
                }
                Ok(true) => println!("Normalized: {}", file.display()),
                Ok(false) => {}
                Err(err) => {
                    failed += 1;
                    warn!("{err:#}");
                }
            }
        }
    }
    Ok(i32::from(stale > 0 || failed > 0))
}

/// Command-dialect files below `root`; other dialects have no grammar to
/// normalize.
fn command_files(root: &Path, roles: &DialectMap) -> Vec<PathBuf> {
    let base = root.parent().unwrap_or(Path::new(""));
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("{err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
            roles.dialect_for(relative) == Dialect::Command
        })
        .map(|entry| entry.into_path())
        .collect()
}
