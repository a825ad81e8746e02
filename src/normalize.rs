//! Rewrites legacy field syntax into canonical `KEY=<<EOF` blocks.
//!
//! Canonical blocks are copied through untouched, so running the pass on its
//! own output is a no-op.

use crate::error::{ParseError, ParseErrorKind};
use crate::source::is_gzip;
use crate::token::{decode_base64, encode_base64, BLOCK_KEYS, RUN, TERMINATOR};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Keys whose value may be single-quoted.
const SINGLE_QUOTE_KEYS: [&str; 3] = ["CMDS", "EXPECT", "EXPECT_ERR"];
/// Keys whose value may be double-quoted or percent-quoted. A double-quoted
/// `CMDS` is tool syntax and stays as written.
const OTHER_QUOTE_KEYS: [&str; 2] = ["EXPECT", "EXPECT_ERR"];
/// Keys with a `KEY64=` spelling.
const BASE64_KEYS: [&str; 3] = ["CMDS", "EXPECT", "EXPECT_ERR"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub lines: Vec<String>,
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    /// Also ensure a blank separator line after every `RUN`.
    pub format: bool,
    /// Turn `KEY64=` fields into plain blocks.
    pub decode_base64: bool,
}

impl Normalizer {
    pub fn new(format: bool) -> Self {
        Self {
            format,
            decode_base64: true,
        }
    }

    /// The rewrite applied to command files before parsing: legacy quoting
    /// and terminators only, base64 fields keep their encoding.
    pub fn for_parsing() -> Self {
        Self::default()
    }

    pub fn normalize(&self, file: &Path, lines: &[String]) -> Result<Normalized, ParseError> {
        let mut out = Vec::with_capacity(lines.len());
        let mut changed = false;
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            let trimmed = line.trim();
            let (key, value) = match trimmed.split_once('=') {
                Some((k, v)) => (k, v.trim_start()),
                None => ("", ""),
            };

            if let Some(token) = value.strip_prefix("<<") {
                if BLOCK_KEYS.contains(&key) {
                    i = if token == TERMINATOR {
                        copy_block(lines, i, &mut out)
                    } else {
                        changed = true;
                        retokenize_block(key, token, lines, i, &mut out)
                    };
                    continue;
                }
            }

            if let Some(quote) = opening_quote(key, value) {
                changed = true;
                i = unquote(file, key, quote, &value[1..], lines, i, &mut out)?;
                continue;
            }

            match base64_field(trimmed).filter(|_| self.decode_base64) {
                Some((key, payload)) => {
                    let text = decode(file, i, &format!("{key}64"), payload)?;
                    let text = if key == "CMDS" { text.trim_start() } else { text.as_str() };
                    let text = text.trim_end_matches('\n');
                    if clashes(text.split('\n')) {
                        out.push(line.clone());
                    } else {
                        changed = true;
                        push_block(&mut out, key, text);
                        if key == "EXPECT" && looks_like_json(text) {
                            out.push(String::new());
                        }
                    }
                }
                None => out.push(line.clone()),
            }
            i += 1;
        }

        if self.format {
            changed |= separate_runs(&mut out);
        }
        Ok(Normalized {
            lines: out,
            changed,
        })
    }

    /// Normalizes one file on disk. Returns whether it needed a rewrite; the
    /// file is only written when it did and `write` is set.
    pub fn normalize_file(&self, path: &Path, write: bool) -> Result<bool> {
        let blob = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if is_gzip(&blob) {
            bail!("refusing to rewrite compressed file {}", path.display());
        }
        let text = String::from_utf8(blob)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;
        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let lines: Vec<String> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        let normalized = self.normalize(path, &lines)?;
        if normalized.changed && write {
            fs::write(path, normalized.lines.join(eol))
                .with_context(|| format!("writing {}", path.display()))?;
            debug!(file = %path.display(), "rewrote to canonical form");
        }
        Ok(normalized.changed)
    }
}

fn copy_block(lines: &[String], start: usize, out: &mut Vec<String>) -> usize {
    out.push(lines[start].clone());
    let mut i = start + 1;
    while i < lines.len() {
        out.push(lines[i].clone());
        i += 1;
        if lines[i - 1].starts_with(TERMINATOR) {
            break;
        }
    }
    i
}

// `CMDS=<<EXPECT` style blocks end at the first line starting with the token.
// A bare terminator is replaced by `EOF`; a terminator that is itself a field
// (`EXPECT=...`) is left in place for the next iteration.
fn retokenize_block(
    key: &str,
    token: &str,
    lines: &[String],
    start: usize,
    out: &mut Vec<String>,
) -> usize {
    let mut i = start + 1;
    while i < lines.len() && !lines[i].trim_start().starts_with(token) {
        i += 1;
    }
    push_body(out, key, lines[start + 1..i].to_vec());
    match lines.get(i) {
        Some(end) if end.trim() == token => i + 1,
        _ => i,
    }
}

fn opening_quote(key: &str, value: &str) -> Option<char> {
    let quote = value.chars().next()?;
    match quote {
        '\'' if SINGLE_QUOTE_KEYS.contains(&key) => Some(quote),
        '"' | '%' if OTHER_QUOTE_KEYS.contains(&key) => Some(quote),
        _ => None,
    }
}

fn unquote(
    file: &Path,
    key: &str,
    quote: char,
    rest: &str,
    lines: &[String],
    start: usize,
    out: &mut Vec<String>,
) -> Result<usize, ParseError> {
    if let Some(end) = rest.find(quote) {
        let body = if end > 0 { vec![rest[..end].to_string()] } else { Vec::new() };
        push_body(out, key, body);
        return Ok(start + 1);
    }
    let mut body = vec![rest.to_string()];
    let mut i = start + 1;
    while i < lines.len() {
        if let Some(end) = lines[i].find(quote) {
            if end > 0 {
                body.push(lines[i][..end].to_string());
            }
            push_body(out, key, body);
            return Ok(i + 1);
        }
        body.push(lines[i].clone());
        i += 1;
    }
    Err(ParseError::new(
        file,
        start + 1,
        ParseErrorKind::Unterminated(key.to_string()),
    ))
}

fn decode(file: &Path, index: usize, key: &str, payload: &str) -> Result<String, ParseError> {
    decode_base64(payload).map_err(|source| {
        ParseError::new(
            file,
            index + 1,
            ParseErrorKind::Base64 {
                key: key.to_string(),
                source,
            },
        )
    })
}

fn base64_field(line: &str) -> Option<(&'static str, &str)> {
    BASE64_KEYS
        .iter()
        .find_map(|&key| Some((key, line.strip_prefix(key)?.strip_prefix("64=")?)))
}

// A body line starting with the terminator would close the block early.
fn clashes<'a>(mut body: impl Iterator<Item = &'a str>) -> bool {
    body.any(|l| l.starts_with(TERMINATOR))
}

/// Emits `body` as a canonical block, or as `KEY64=` when a line would end
/// the block early.
fn push_body(out: &mut Vec<String>, key: &str, body: Vec<String>) {
    if BASE64_KEYS.contains(&key) && clashes(body.iter().map(String::as_str)) {
        let text: String = body.iter().map(|l| format!("{l}\n")).collect();
        out.push(format!("{key}64={}", encode_base64(&text)));
        return;
    }
    out.push(format!("{key}=<<{TERMINATOR}"));
    out.extend(body);
    out.push(TERMINATOR.to_string());
}

fn push_block(out: &mut Vec<String>, key: &str, text: &str) {
    out.push(format!("{key}=<<{TERMINATOR}"));
    if !text.is_empty() {
        out.extend(text.split('\n').map(str::to_string));
    }
    out.push(TERMINATOR.to_string());
}

fn looks_like_json(text: &str) -> bool {
    (text.starts_with('[') && text.ends_with(']')) || (text.starts_with('{') && text.ends_with('}'))
}

fn separate_runs(lines: &mut Vec<String>) -> bool {
    let mut changed = false;
    let mut out = Vec::with_capacity(lines.len());
    let mut after_run = false;
    for line in lines.drain(..) {
        if after_run && !line.trim().is_empty() {
            out.push(String::new());
            changed = true;
        }
        after_run = line.trim() == RUN;
        out.push(line);
    }
    *lines = out;
    changed
}
