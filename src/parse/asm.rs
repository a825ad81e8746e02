//! Assembly round-trip lines: `TYPE "asm text" bytes [offset]`.
//!
//! The file name carries the target as `ARCH[_CPU]_BITS`.

use super::ParsedFile;
use crate::error::Diagnostic;
use crate::record::{Dialect, Encoding, TestRecord};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    arch: String,
    cpu: Option<String>,
    bits: Option<String>,
}

pub fn parse(file: &Path, lines: &[String]) -> ParsedFile {
    let mut out = ParsedFile::default();
    let stem = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(target) = target_from_name(&stem) else {
        out.diagnostics.push(Diagnostic::new(
            file,
            0,
            format!("wrong asm file name \"{stem}\", expected ARCH[_CPU]_BITS"),
        ));
        return out;
    };

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words = split_words(line);
        if words.len() < 3 {
            out.diagnostics.push(Diagnostic::new(
                file,
                index + 1,
                format!("wrong asm test format: {line}"),
            ));
            continue;
        }
        out.records
            .extend(records_for_line(file, &stem, &target, index + 1, &words));
    }
    out
}

fn target_from_name(stem: &str) -> Option<Target> {
    let parts: Vec<&str> = stem.split('_').collect();
    let arch = parts.first().filter(|a| !a.is_empty())?.to_string();
    match parts.len() {
        1 => Some(Target {
            arch,
            cpu: None,
            bits: None,
        }),
        2 => Some(Target {
            arch,
            cpu: None,
            bits: Some(parts[1].to_string()),
        }),
        3 => Some(Target {
            arch,
            cpu: Some(parts[1].to_string()),
            bits: Some(parts[2].to_string()),
        }),
        _ => None,
    }
}

// Words are runs of non-space text where a double-quoted span may contain spaces.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quote = !in_quote;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quote => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn records_for_line(
    file: &Path,
    stem: &str,
    target: &Target,
    line: usize,
    words: &[String],
) -> Vec<TestRecord> {
    let flags = words[0].as_str();
    let asm = words[1].replace('"', "");
    let bytes = words[2].as_str();
    let offset = words.get(3).map_or("0", String::as_str);
    let big_endian = flags.contains('E');
    let broken = flags.contains('B');

    let mut records = Vec::new();
    let mut seen = String::new();
    for flag in flags.chars().filter(|c| matches!(c, 'd' | 'a')) {
        if seen.contains(flag) {
            continue;
        }
        seen.push(flag);
        let mut record = TestRecord::new(Dialect::Assembly, file, line);
        record.arch = Some(target.arch.clone());
        record.bits = target.bits.clone();
        record.arguments = target_arguments(target);
        record.encoding = Encoding::Derived;
        record.broken = broken;
        record.script = vec![
            format!("e cfg.bigendian={big_endian}"),
            format!("s {offset}"),
        ];
        if flag == 'd' {
            record.name = format!("{stem}: {bytes} => \"{asm}\" (disassemble)");
            record.script.push(format!("pad {bytes}"));
            record.expected_stdout = Some(asm.clone());
        } else {
            record.name = format!("{stem}: \"{asm}\" => {bytes} (assemble)");
            record.script.push(format!("\"pa {asm}\""));
            record.expected_stdout = Some(bytes.to_string());
        }
        records.push(record);
    }
    records
}

fn target_arguments(target: &Target) -> Vec<String> {
    let mut args = vec!["-e".to_string(), format!("asm.arch={}", target.arch)];
    if let Some(cpu) = &target.cpu {
        args.push("-e".into());
        args.push(format!("asm.cpu={cpu}"));
    }
    if let Some(bits) = &target.bits {
        args.push("-e".into());
        args.push(format!("asm.bits={bits}"));
    }
    args
}
