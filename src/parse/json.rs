use super::ParsedFile;
use crate::record::{Dialect, TestRecord};
use std::path::Path;

const BROKEN_SUFFIX: &str = " BROKEN";

/// One record per fixture binary for every command line.
pub fn parse(file: &Path, lines: &[String], fixtures: &[String]) -> ParsedFile {
    let mut out = ParsedFile::default();
    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (command, broken) = match line.strip_suffix(BROKEN_SUFFIX) {
            Some(command) => (command.trim(), true),
            None => (line, false),
        };
        for fixture in fixtures {
            let mut record = TestRecord::new(Dialect::Json, file, index + 1);
            record.name = command.to_string();
            record.broken = broken;
            record.path = Some(fixture.clone());
            record.target_files = vec![fixture.clone()];
            record.script = vec!["aaa".to_string(), command.to_string()];
            out.records.push(record);
        }
    }
    out
}
