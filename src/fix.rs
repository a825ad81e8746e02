//! In-place edits of test files, keyed by record name.
//!
//! The text transforms are pure: they take the whole file and return the
//! rewritten file, or `None` when the record cannot be found. [`Fixer`] wraps
//! them in read-modify-write.

use crate::record::{Dialect, Encoding, TestRecord};
use crate::source::is_gzip;
use crate::token::{encode_base64, RUN, TERMINATOR};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const BROKEN_LINE: &str = "BROKEN=1";
pub const DEFAULT_UNMARK_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn key(self) -> &'static str {
        match self {
            Stream::Stdout => "EXPECT",
            Stream::Stderr => "EXPECT_ERR",
        }
    }
}

fn split(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

fn key_of(line: &str) -> Option<&str> {
    line.trim_start().split_once('=').map(|(k, _)| k)
}

/// Lines `[start, end)` of the record: from its `NAME=` line up to, not
/// including, its `RUN`. A `RUN` inside a multi-line value does not count.
fn section(lines: &[String], name: &str) -> Option<(usize, usize)> {
    let wanted = format!("NAME={name}");
    let start = lines.iter().position(|l| l.trim_end() == wanted)?;
    let mut end = start + 1;
    while end < lines.len() && lines[end].trim() != RUN {
        end += index_step(lines, end, lines.len());
    }
    Some((start, end.min(lines.len())))
}

/// Number of lines the field starting at `lines[at]` occupies, whatever
/// syntax it was written in.
fn field_extent(lines: &[String], at: usize, limit: usize) -> usize {
    let Some((_, value)) = lines[at].trim_start().split_once('=') else {
        return 1;
    };
    let value = value.trim_start();
    if let Some(token) = value.strip_prefix("<<") {
        let token = token.trim();
        for (i, line) in lines.iter().enumerate().take(limit).skip(at + 1) {
            if line.trim_start().starts_with(token) {
                let bare = token == TERMINATOR || line.trim() == token;
                return i - at + usize::from(bare);
            }
        }
        return limit - at;
    }
    let Some(quote) = value.chars().next().filter(|c| matches!(c, '\'' | '"' | '%')) else {
        return 1;
    };
    if value[1..].contains(quote) {
        return 1;
    }
    for (i, line) in lines.iter().enumerate().take(limit).skip(at + 1) {
        if line.contains(quote) {
            return i - at + 1;
        }
    }
    1
}

/// Replaces the first field among `keys` inside the record with `block`, or
/// inserts `block` right before the record's `RUN` when there is none.
fn replace_field(text: &str, name: &str, keys: &[&str], block: &[String]) -> Option<String> {
    let mut lines = split(text);
    let (start, end) = section(&lines, name)?;
    let found = (start + 1..end).find(|&i| key_of(&lines[i]).is_some_and(|k| keys.contains(&k)));
    match found {
        Some(at) => {
            let len = field_extent(&lines, at, end);
            lines.splice(at..at + len, block.iter().cloned());
        }
        None => {
            lines.splice(end..end, block.iter().cloned());
        }
    }
    Some(lines.join("\n"))
}

pub fn mark_broken(text: &str, name: &str) -> Option<String> {
    let mut lines = split(text);
    let (start, end) = section(&lines, name)?;
    let already = lines[start + 1..end]
        .iter()
        .any(|l| l.trim() == "BROKEN" || l.trim() == BROKEN_LINE);
    if !already {
        lines.insert(start + 1, BROKEN_LINE.to_string());
    }
    Some(lines.join("\n"))
}

pub fn unmark_broken(text: &str, name: &str) -> Option<String> {
    let mut lines = split(text);
    let (start, end) = section(&lines, name)?;
    let mut index = start + 1;
    let mut end = end;
    while index < end {
        let line = lines[index].trim();
        if line == "BROKEN" || line.starts_with("BROKEN=") {
            lines.remove(index);
            end -= 1;
        } else {
            index += index_step(&lines, index, end);
        }
    }
    Some(lines.join("\n"))
}

// Skip over multi-line values so a `BROKEN` inside an expectation survives.
fn index_step(lines: &[String], index: usize, end: usize) -> usize {
    if key_of(&lines[index]).is_some() {
        field_extent(lines, index, end).max(1)
    } else {
        1
    }
}

/// Canonical block holding `actual`, falling back to the base64 key when the
/// output itself contains a terminator line.
pub fn expectation_lines(stream: Stream, actual: &str, encoding: Encoding) -> Vec<String> {
    let key = stream.key();
    let clashes = actual.split('\n').any(|l| l.starts_with(TERMINATOR));
    if (stream == Stream::Stdout && encoding == Encoding::Base64) || clashes {
        return vec![format!("{key}64={}", encode_base64(actual))];
    }
    let mut lines = vec![format!("{key}=<<{TERMINATOR}")];
    let body = actual.strip_suffix('\n').unwrap_or(actual);
    if !actual.is_empty() {
        lines.extend(body.split('\n').map(str::to_string));
    }
    lines.push(TERMINATOR.to_string());
    lines
}

pub fn rewrite_expectation(
    text: &str,
    name: &str,
    stream: Stream,
    actual: &str,
    encoding: Encoding,
) -> Option<String> {
    let key = stream.key();
    let key64 = format!("{key}64");
    let block = expectation_lines(stream, actual, encoding);
    replace_field(text, name, &[key, key64.as_str()], &block)
}

pub fn rewrite_commands(text: &str, name: &str, script: &[String]) -> Option<String> {
    let mut block = vec![format!("CMDS=<<{TERMINATOR}")];
    block.extend(script.iter().cloned());
    block.push(TERMINATOR.to_string());
    replace_field(text, name, &["CMDS", "CMDS64"], &block)
}

/// Flags a one-line record (assembly or JSON) as broken.
pub fn mark_line_broken(text: &str, dialect: Dialect, line: usize) -> Option<String> {
    edit_line(text, line, |l| match dialect {
        Dialect::Json if !l.trim_end().ends_with(" BROKEN") => Some(format!("{} BROKEN", l.trim_end())),
        Dialect::Assembly => {
            let (flags, rest) = l.split_once(char::is_whitespace)?;
            (!flags.contains('B')).then(|| format!("{flags}B {rest}"))
        }
        _ => None,
    })
}

pub fn unmark_line_broken(text: &str, dialect: Dialect, line: usize) -> Option<String> {
    edit_line(text, line, |l| match dialect {
        Dialect::Json => l.trim_end().strip_suffix(" BROKEN").map(str::to_string),
        Dialect::Assembly => {
            let (flags, rest) = l.split_once(char::is_whitespace)?;
            flags
                .contains('B')
                .then(|| format!("{} {rest}", flags.replace('B', "")))
        }
        _ => None,
    })
}

// `None` from `f` leaves the line as it was.
fn edit_line(text: &str, line: usize, f: impl Fn(&str) -> Option<String>) -> Option<String> {
    let mut lines = split(text);
    let target = lines.get_mut(line.checked_sub(1)?)?;
    if let Some(edited) = f(target) {
        *target = edited;
    }
    Some(lines.join("\n"))
}

/// Un-marks a JSON command only once every fixture binary passed with it.
#[derive(Debug, Clone)]
pub struct UnmarkThrottle {
    threshold: usize,
    seen: HashMap<String, usize>,
}

impl UnmarkThrottle {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            seen: HashMap::new(),
        }
    }

    /// Counts one pass for `key`; true exactly when the threshold is reached.
    pub fn admit(&mut self, key: &str) -> bool {
        let count = self.seen.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count == self.threshold
    }
}

pub struct Fixer {
    throttle: UnmarkThrottle,
}

impl Fixer {
    pub fn new(unmark_threshold: usize) -> Self {
        Self {
            throttle: UnmarkThrottle::new(unmark_threshold),
        }
    }

    /// Replaces the failing expectations of `record` with what it printed.
    pub fn fix(&self, record: &TestRecord) -> Result<()> {
        if record.dialect != Dialect::Command {
            bail!("{} records have no expectation to fix", record.dialect.as_str());
        }
        let Some(run) = &record.run else {
            bail!("{} has not run yet", record.name);
        };
        let (fix_out, fix_err) = match record.outcome {
            Some(o) => (o.stdout_failed, o.stderr_failed),
            None => (true, record.expected_stderr.is_some()),
        };
        edit_file(&record.source, |text| {
            let mut text = text.to_string();
            if fix_out {
                text = rewrite_expectation(&text, &record.name, Stream::Stdout, &run.stdout, record.encoding)
                    .with_context(|| missing(record))?;
            }
            if fix_err {
                text = rewrite_expectation(&text, &record.name, Stream::Stderr, &run.stderr, Encoding::Text)
                    .with_context(|| missing(record))?;
            }
            Ok(text)
        })?;
        info!("fixed {} in {}", record.name, record.source.display());
        Ok(())
    }

    pub fn mark_broken(&self, record: &TestRecord) -> Result<()> {
        edit_file(&record.source, |text| {
            let marked = match record.dialect {
                Dialect::Command => mark_broken(text, &record.name),
                Dialect::Json | Dialect::Assembly => {
                    mark_line_broken(text, record.dialect, record.first_line)
                }
                Dialect::Corpus => None,
            };
            marked.with_context(|| missing(record))
        })?;
        info!("marked {} as broken", record.name);
        Ok(())
    }

    pub fn set_commands(&self, record: &TestRecord, script: &[String]) -> Result<()> {
        if record.dialect != Dialect::Command {
            bail!("{} records have no commands to edit", record.dialect.as_str());
        }
        edit_file(&record.source, |text| {
            rewrite_commands(text, &record.name, script).with_context(|| missing(record))
        })
    }

    /// Removes the broken flag of a record that passed. Returns whether the
    /// file was touched; JSON commands wait for the throttle.
    pub fn unmark(&mut self, record: &TestRecord) -> Result<bool> {
        match record.dialect {
            Dialect::Corpus => Ok(false),
            Dialect::Json => {
                let key = format!("{}:{}", record.source.display(), record.first_line);
                if !self.throttle.admit(&key) {
                    return Ok(false);
                }
                edit_file(&record.source, |text| {
                    unmark_line_broken(text, Dialect::Json, record.first_line)
                        .with_context(|| missing(record))
                })?;
                Ok(true)
            }
            Dialect::Assembly => {
                edit_file(&record.source, |text| {
                    unmark_line_broken(text, Dialect::Assembly, record.first_line)
                        .with_context(|| missing(record))
                })?;
                Ok(true)
            }
            Dialect::Command => {
                edit_file(&record.source, |text| {
                    unmark_broken(text, &record.name).with_context(|| missing(record))
                })?;
                Ok(true)
            }
        }
    }
}

fn missing(record: &TestRecord) -> String {
    format!(
        "no record named {} in {}",
        record.name,
        record.source.display()
    )
}

fn edit_file(path: &Path, edit: impl FnOnce(&str) -> Result<String>) -> Result<()> {
    let blob = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if is_gzip(&blob) {
        bail!("refusing to edit compressed file {}", path.display());
    }
    let text = String::from_utf8(blob)
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
    let edited = edit(&text)?;
    if edited != text {
        fs::write(path, edited).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
