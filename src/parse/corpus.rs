use crate::record::{Dialect, TestRecord};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A crash-smoke record for one artifact. There is no text to parse; the
/// engine supplies the invocation. The record's source is the corpus
/// directory so one tally covers the whole corpus.
pub fn record(artifact: &Path) -> TestRecord {
    let dir = artifact.parent().unwrap_or(artifact);
    let mut record = TestRecord::new(Dialect::Corpus, dir, 0);
    let display = artifact.to_string_lossy().into_owned();
    record.name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| display.clone());
    record.path = Some(display.clone());
    record.target_files = vec![display];
    record
}

/// Regular files of a corpus directory, sorted by name.
pub fn artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type()?.is_file() && !hidden {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
