//! Turns one discovered file into test records.
//!
//! Each dialect has its own grammar; they all produce [`TestRecord`]s and
//! share the same split between fatal [`ParseError`]s and recoverable
//! [`Diagnostic`]s.

pub mod asm;
pub mod command;
pub mod corpus;
pub mod json;

use crate::error::{Diagnostic, ParseError};
use crate::normalize::Normalizer;
use crate::record::{Dialect, TestRecord};
use crate::source::LineSource;
use anyhow::Result;
use std::collections::BTreeSet;
use std::env;
use std::path::Path;

/// Binaries every JSON command is run against.
pub const JSON_FIXTURES: [&str; 4] = [
    "../bins/elf/crackme0x00b",
    "../bins/pe/version_std.exe",
    "../bins/elf/bomb",
    "../bins/mach0/hello-objc",
];

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Variable names already present in the harness environment; `$VAR=`
    /// lines never override them.
    pub ambient_env: BTreeSet<String>,
    pub json_fixtures: Vec<String>,
}

impl ParseOptions {
    pub fn from_env() -> Self {
        Self {
            ambient_env: env::vars_os()
                .filter_map(|(k, _)| k.into_string().ok())
                .collect(),
            ..Self::default()
        }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            ambient_env: BTreeSet::new(),
            json_fixtures: JSON_FIXTURES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedFile {
    pub records: Vec<TestRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parses already-read lines of a text dialect.
pub fn parse_lines(
    file: &Path,
    dialect: Dialect,
    lines: &[String],
    opts: &ParseOptions,
) -> Result<ParsedFile, ParseError> {
    match dialect {
        Dialect::Command => command::parse(file, lines, opts),
        Dialect::Assembly => Ok(asm::parse(file, lines)),
        Dialect::Json => Ok(json::parse(file, lines, &opts.json_fixtures)),
        Dialect::Corpus => Ok(ParsedFile {
            records: vec![corpus::record(file)],
            diagnostics: Vec::new(),
        }),
    }
}

/// Reads and parses one file. Corpus artifacts are binaries and are never
/// read; command files get their legacy quoting rewritten in memory first,
/// so record lines refer to the rewritten text.
pub fn load(
    source: &LineSource,
    file: &Path,
    dialect: Dialect,
    opts: &ParseOptions,
) -> Result<ParsedFile> {
    if dialect == Dialect::Corpus {
        return Ok(parse_lines(file, dialect, &[], opts)?);
    }
    let text = source.read(file)?;
    if dialect == Dialect::Command {
        let normalized = Normalizer::for_parsing().normalize(file, &text.lines)?;
        return Ok(parse_lines(file, dialect, &normalized.lines, opts)?);
    }
    Ok(parse_lines(file, dialect, &text.lines, opts)?)
}
