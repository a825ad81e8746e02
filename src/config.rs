use crate::discover::{host_tag, DialectMap, Discovery};
use crate::engine::{Engine, ScriptMode, DEFAULT_CORPUS_TIMEOUT};
use crate::fix::DEFAULT_UNMARK_THRESHOLD;
use crate::record::Dialect;
use crate::report::LedgerOptions;
use crate::schedule::DEFAULT_JOBS;
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BINARY: &str = "radare2";
pub const BINARY_ENV: &str = "R2R_BIN";
pub const DEFAULT_DB: &str = "db";
pub const DEFAULT_CORPUS_DIR: &str = "bins/fuzzed";

/// Everything a run needs, gathered from the command line and environment.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub binary: PathBuf,
    pub jobs: usize,
    pub corpus_timeout: Duration,
    pub script_mode: ScriptMode,
    pub extras_dir: String,
    pub roles: DialectMap,
    /// Passes a JSON command needs before its `BROKEN` mark is dropped.
    pub unmark_threshold: usize,
    pub quiet_ok: bool,
    pub db: PathBuf,
    pub corpus_dir: PathBuf,
    pub filter: Option<String>,
    pub dialect: Option<Dialect>,
    pub json: bool,
    pub list: bool,
    pub interactive: bool,
    pub unmark_fixed: bool,
    pub verbose: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            jobs: DEFAULT_JOBS,
            corpus_timeout: DEFAULT_CORPUS_TIMEOUT,
            script_mode: ScriptMode::File,
            extras_dir: "extras".into(),
            roles: DialectMap::default(),
            unmark_threshold: DEFAULT_UNMARK_THRESHOLD,
            quiet_ok: false,
            db: PathBuf::from(DEFAULT_DB),
            corpus_dir: PathBuf::from(DEFAULT_CORPUS_DIR),
            filter: None,
            dialect: None,
            json: false,
            list: false,
            interactive: false,
            unmark_fixed: false,
            verbose: false,
        }
    }
}

impl HarnessConfig {
    pub fn engine(&self) -> Engine {
        Engine {
            binary: self.binary.clone(),
            mode: self.script_mode,
            corpus_timeout: self.corpus_timeout,
        }
    }

    pub fn discovery(&self) -> Discovery {
        Discovery {
            roles: self.roles.clone(),
            filter: self.filter.clone(),
            dialect: self.dialect,
            extras_dir: self.extras_dir.clone(),
            host: host_tag(),
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            quiet_ok: self.quiet_ok,
            verbose: self.verbose,
            json: self.json,
        }
    }
}

/// `NOOK` set to anything but `0` hides passing records; CI implies it.
pub fn quiet_ok(nook: Option<&str>, ci: bool) -> bool {
    match nook {
        Some(value) => value != "0",
        None => ci,
    }
}

pub fn quiet_ok_from_env() -> bool {
    let nook = env::var("NOOK").ok();
    quiet_ok(nook.as_deref(), env::var_os("CI").is_some())
}

/// Finds the tool: an explicit path wins, then `R2R_BIN`, then `radare2` on
/// `PATH`.
pub fn resolve_binary(explicit: Option<&Path>, from_env: Option<String>) -> Result<PathBuf> {
    let wanted = match (explicit, from_env) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(value)) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_BINARY),
    };
    which::which(&wanted).with_context(|| format!("{} not found", wanted.display()))
}
