use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Target used when a record names no file: the tool opens an empty buffer.
pub const EMPTY_TARGET: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[value(name = "cmd")]
    Command,
    #[value(name = "asm")]
    Assembly,
    Json,
    Corpus,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Command => "cmd",
            Dialect::Assembly => "asm",
            Dialect::Json => "json",
            Dialect::Corpus => "corpus",
        }
    }
}

/// How the expected stdout was written down, which also decides how it is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// `EXPECT=`: exact comparison.
    #[default]
    Text,
    /// `EXPECT64=`: binary-safe, compared with surrounding whitespace trimmed.
    Base64,
    /// Derived from an assembly line; trimmed comparison, never written back.
    Derived,
}

impl Encoding {
    pub fn trims(self) -> bool {
        !matches!(self, Encoding::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FX")]
    Fixed,
    #[serde(rename = "BR")]
    Broken,
    #[serde(rename = "XX")]
    Regression,
}

impl Verdict {
    pub fn tag(self) -> &'static str {
        match self {
            Verdict::Ok => "[OK]",
            Verdict::Fixed => "[FX]",
            Verdict::Broken => "[BR]",
            Verdict::Regression => "[XX]",
        }
    }

    pub fn passed(self) -> bool {
        matches!(self, Verdict::Ok | Verdict::Fixed)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What one execution of the tool left behind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Set when the process never produced a usable result (spawn failure, timeout).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub verdict: Verdict,
    pub stdout_failed: bool,
    pub stderr_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub name: String,
    pub dialect: Dialect,
    pub source: PathBuf,
    /// 1-based, inclusive.
    pub first_line: usize,
    pub last_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub target_files: Vec<String>,
    pub arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<String>,
    pub script: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_stderr: Option<String>,
    pub encoding: Encoding,
    pub broken: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_env: BTreeMap<String, String>,
    pub one_stream: bool,
    /// Records outside the extras directories run with plugin loading disabled.
    pub load_plugins: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl TestRecord {
    pub fn new(dialect: Dialect, source: &Path, line: usize) -> Self {
        Self {
            name: String::new(),
            dialect,
            source: source.to_path_buf(),
            first_line: line,
            last_line: line,
            path: None,
            target_files: vec![EMPTY_TARGET.to_string()],
            arguments: Vec::new(),
            arch: None,
            bits: None,
            script: Vec::new(),
            expected_stdout: None,
            expected_stderr: None,
            encoding: Encoding::Text,
            broken: false,
            custom_env: BTreeMap::new(),
            one_stream: false,
            load_plugins: false,
            run: None,
            outcome: None,
        }
    }

    /// Key that must be unique within a run. JSON lines fan out over several
    /// fixture binaries under one name, so their key includes the target;
    /// corpus artifacts are keyed by path.
    pub fn unique_key(&self) -> String {
        match self.dialect {
            Dialect::Json => format!("{} @ {}", self.name, self.target_files.join(" ")),
            Dialect::Corpus => self.target_files.join(" "),
            _ => self.name.clone(),
        }
    }

    pub fn is_runnable(&self) -> bool {
        match self.dialect {
            Dialect::Corpus => !self.target_files.is_empty(),
            _ => !self.target_files.is_empty() && !self.script.is_empty(),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.outcome.map(|o| o.verdict)
    }

    pub fn stdout(&self) -> &str {
        self.run.as_ref().map_or("", |r| r.stdout.as_str())
    }

    pub fn stderr(&self) -> &str {
        self.run.as_ref().map_or("", |r| r.stderr.as_str())
    }

    /// Attach a synthetic result for an execution that never completed.
    pub fn force_failure(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let run = self.run.get_or_insert_with(RunResult::default);
        run.stderr = reason.clone();
        run.forced = Some(reason);
    }
}
