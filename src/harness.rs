//! One run end to end: discover, parse, schedule, report, then the optional
//! un-marking and triage passes.

use crate::config::HarnessConfig;
use crate::discover::{Candidate, Discovery};
use crate::error::{ParseError, ParseErrorKind};
use crate::fix::Fixer;
use crate::parse::{self, corpus, ParseOptions};
use crate::record::{Dialect, TestRecord};
use crate::report::{Finished, JsonReport, Ledger};
use crate::schedule::{FileBatch, Scheduler};
use crate::source::{LineSource, Platform};
use crate::triage::{Triage, TriageEnd};
use anyhow::Result;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::iter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct Harness {
    config: HarnessConfig,
    source: LineSource,
    options: ParseOptions,
}

/// Where each command test name was first seen.
type Registry = HashMap<String, (PathBuf, usize)>;

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            source: LineSource::new(Platform::host()),
            options: ParseOptions::from_env(),
        }
    }

    pub fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs everything and returns the process exit code. Triage reads its
    /// answers from `input` and writes to the same stream as the report.
    pub fn execute<W, R>(&self, roots: &[PathBuf], out: W, input: R) -> Result<i32>
    where
        W: Write + Send,
        R: BufRead,
    {
        if self.config.list {
            self.list(roots, out)?;
            return Ok(0);
        }
        let mut finished = self.run(roots, out)?;
        let report = finished.report;
        if self.config.json {
            let doc = JsonReport {
                report,
                results: &finished.results,
            };
            serde_json::to_writer_pretty(&mut finished.out, &doc)?;
            writeln!(finished.out)?;
        } else {
            writeln!(finished.out, "[--] {}", report.summary_line())?;
        }

        if self.config.unmark_fixed {
            self.unmark(&finished.fixed);
        }

        let mut code = report.exit_code();
        if self.config.interactive && !finished.queue.is_empty() {
            writeln!(finished.out, "{} failed tests", finished.queue.len())?;
            let fixer = Fixer::new(self.config.unmark_threshold);
            let end = Triage::new(&fixer, input, &mut finished.out).run(&mut finished.queue)?;
            if end == TriageEnd::Aborted {
                code = 1;
            }
        }
        Ok(code)
    }

    /// Discovers, parses and runs every record; the ledger writes to `out`
    /// while records settle.
    pub fn run<W: Write + Send>(&self, roots: &[PathBuf], out: W) -> Result<Finished<W>> {
        let discovery = self.config.discovery();
        let engine = self.config.engine();
        let ledger = Ledger::new(out, self.config.ledger_options());
        let batches = self.batches(&discovery, roots, |line| ledger.note(line))?;
        let outcome = Scheduler::new(&engine, self.config.jobs).run(batches, &ledger);
        let finished = ledger.finish();
        outcome?;
        Ok(finished)
    }

    /// Prints `<file> <name>` for every record instead of running them.
    pub fn list<W: Write>(&self, roots: &[PathBuf], mut out: W) -> Result<()> {
        let discovery = self.config.discovery();
        for batch in self.batches(&discovery, roots, |_| {})? {
            for record in batch?.records {
                writeln!(out, "{} {}", record.source.display(), record.name)?;
            }
        }
        Ok(())
    }

    /// Removes the broken mark of every record that passed anyway.
    pub fn unmark(&self, fixed: &[TestRecord]) {
        let mut fixer = Fixer::new(self.config.unmark_threshold);
        for record in fixed {
            match fixer.unmark(record) {
                Ok(true) => info!("un-marked {} in {}", record.name, record.source.display()),
                Ok(false) => {}
                Err(err) => warn!("{}: {err:#}", record.name),
            }
        }
    }

    fn batches<'a>(
        &'a self,
        discovery: &'a Discovery,
        roots: &[PathBuf],
        note: impl Fn(&str) + 'a,
    ) -> Result<impl Iterator<Item = Result<FileBatch>> + 'a> {
        let default_roots = [self.config.db.clone()];
        let roots = if roots.is_empty() { &default_roots[..] } else { roots };
        let walks = roots
            .iter()
            .map(|root| discovery.walk(root))
            .collect::<Result<Vec<_>>>()?;
        let mut registry = Registry::new();
        let files = walks
            .into_iter()
            .flatten()
            .filter_map(move |candidate| self.load(candidate, &mut registry).transpose());
        let corpus = iter::once_with(move || {
            if !discovery.wants_corpus() {
                return None;
            }
            let batch = self.corpus_batch(&self.config.corpus_dir)?;
            note("[--] fuzz binaries");
            Some(Ok(batch))
        })
        .flatten();
        Ok(files.chain(corpus))
    }

    /// Parses one discovered file. Grammar errors skip the file; only a
    /// duplicate name is returned as an error.
    fn load(&self, candidate: Candidate, registry: &mut Registry) -> Result<Option<FileBatch>> {
        if candidate.dialect == Dialect::Corpus {
            debug!(
                "skipping {}: fuzz binaries come from the corpus directory",
                candidate.path.display()
            );
            return Ok(None);
        }
        let parsed = match parse::load(&self.source, &candidate.path, candidate.dialect, &self.options)
        {
            Ok(parsed) => parsed,
            Err(err) => {
                if err.downcast_ref::<ParseError>().is_some_and(ParseError::is_run_fatal) {
                    return Err(err);
                }
                warn!("skipping {}: {err:#}", candidate.path.display());
                return Ok(None);
            }
        };
        for diagnostic in &parsed.diagnostics {
            warn!("{diagnostic}");
        }

        let mut records = parsed.records;
        for record in &mut records {
            record.load_plugins = candidate.extras;
            if record.dialect == Dialect::Command {
                register(registry, record)?;
            }
        }
        Ok(Some(FileBatch {
            file: candidate.path,
            records,
        }))
    }

    /// `None` when there is nothing to run.
    fn corpus_batch(&self, dir: &Path) -> Option<FileBatch> {
        if !dir.is_dir() {
            debug!("no corpus at {}", dir.display());
            return None;
        }
        match corpus::artifacts(dir) {
            Ok(files) if files.is_empty() => None,
            Ok(files) => Some(FileBatch {
                file: dir.to_path_buf(),
                records: files.iter().map(|f| corpus::record(f)).collect(),
            }),
            Err(err) => {
                warn!("skipping corpus: {err:#}");
                None
            }
        }
    }
}

fn register(registry: &mut Registry, record: &TestRecord) -> Result<(), ParseError> {
    let key = record.unique_key();
    if let Some((first_file, first_line)) = registry.get(&key) {
        return Err(ParseError::new(
            &record.source,
            record.first_line,
            ParseErrorKind::DuplicateName {
                name: record.name.clone(),
                first_file: first_file.clone(),
                first_line: *first_line,
            },
        ));
    }
    registry.insert(key, (record.source.clone(), record.first_line));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: HarnessConfig,
    }

    impl Fixture {
        fn new(stub: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let binary = dir.path().join("r2stub");
            fs::write(&binary, format!("#!/bin/sh\n{stub}\n")).unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            let config = HarnessConfig {
                binary,
                db: dir.path().join("db"),
                corpus_dir: dir.path().join("bins/fuzzed"),
                jobs: 2,
                ..HarnessConfig::default()
            };
            Self { dir, config }
        }

        fn write(&self, rel: &str, text: &str) -> PathBuf {
            let path = self.dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, text).unwrap();
            path
        }

        fn harness(&self) -> Harness {
            Harness::new(self.config.clone()).with_parse_options(ParseOptions::default())
        }
    }

    const HI: &str = "NAME=hi\nFILE=-\nCMDS=<<EOF\n?e hi\nEOF\nEXPECT=<<EOF\nhi\nEOF\nRUN\n";

    #[test]
    fn bad_file_is_skipped_and_run_continues() {
        let fx = Fixture::new("echo hi");
        fx.write("db/cmd/good", HI);
        fx.write("db/cmd/bad", "NAME=x\nBOGUS=1\nRUN\n");
        let finished = fx.harness().run(&[], Vec::new()).unwrap();
        assert_eq!(finished.report.total, 1);
        assert_eq!(finished.report.passed, 1);
    }

    #[test]
    fn duplicates_across_files_are_fatal() {
        let fx = Fixture::new("echo hi");
        fx.write("db/cmd/a", HI);
        fx.write("db/cmd/b", HI);
        let err = fx.harness().run(&[], Vec::new()).err().unwrap();
        let parse = err.downcast_ref::<ParseError>().unwrap();
        assert!(parse.is_run_fatal());
        assert!(parse.file.ends_with("db/cmd/b"));
    }

    #[test]
    fn extras_records_load_plugins() {
        let fx = Fixture::new("env");
        fx.write("db/extras/cmd_plugins", "NAME=plug\nFILE=-\nCMDS=?e\nRUN\n");
        let mut config = fx.config.clone();
        config.filter = Some("extras".into());
        let finished = Harness::new(config).run(&[], Vec::new()).unwrap();
        assert_eq!(finished.results.len(), 1);
        assert!(finished.results[0].load_plugins);
        assert!(!finished.results[0].stdout().contains("R2_NOPLUGINS"));
    }

    #[test]
    fn corpus_batch_runs_once_per_artifact() {
        let fx = Fixture::new("exit 0");
        fx.write("bins/fuzzed/crash1", "\x7fELF");
        fx.write("bins/fuzzed/crash2", "\x7fELF");
        fs::create_dir_all(fx.dir.path().join("db")).unwrap();
        let finished = fx.harness().run(&[], Vec::new()).unwrap();
        assert_eq!(finished.report.passed, 2);
        let out = String::from_utf8(finished.out).unwrap();
        assert!(out.contains("[--] fuzz binaries"));
        assert_eq!(out.matches("[**]").count(), 1);
    }

    #[test]
    fn missing_corpus_prints_no_banner() {
        let fx = Fixture::new("echo hi");
        fx.write("db/cmd/a", HI);
        let finished = fx.harness().run(&[], Vec::new()).unwrap();
        let out = String::from_utf8(finished.out).unwrap();
        assert!(!out.contains("fuzz binaries"));
        assert!(out.starts_with("[OK] "));

        fs::create_dir_all(fx.dir.path().join("bins/fuzzed")).unwrap();
        let finished = fx.harness().run(&[], Vec::new()).unwrap();
        let out = String::from_utf8(finished.out).unwrap();
        assert!(!out.contains("fuzz binaries"));
    }

    #[test]
    fn legacy_quoted_record_runs_as_written() {
        let fx = Fixture::new("echo hi");
        fx.write("db/cmd/q", "NAME=q\nFILE=-\nCMDS='?e hi'\nEXPECT='hi'\nRUN\n");
        let finished = fx.harness().run(&[], Vec::new()).unwrap();
        let record = &finished.results[0];
        assert_eq!(record.script, vec!["?e hi"]);
        assert_eq!(record.verdict(), Some(crate::record::Verdict::Ok));
    }

    #[test]
    fn list_prints_file_and_name() {
        let fx = Fixture::new("true");
        let path = fx.write("db/cmd/a", HI);
        let mut out = Vec::new();
        fx.harness().list(&[], &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, format!("{} hi\n", path.display()));
    }

    #[test]
    fn exit_code_tracks_regressions_and_triage_quit() {
        let fx = Fixture::new("echo bye");
        fx.write("db/cmd/a", HI);
        let harness = fx.harness();
        let mut out = Vec::new();
        assert_eq!(harness.execute(&[], &mut out, Cursor::new("")).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[XX]"));
        assert!(text.contains("1 tests: 0 OK, 0 BR, 1 XX, 0 FX"));

        let mut config = fx.config.clone();
        config.interactive = true;
        let mut out = Vec::new();
        let code = Harness::new(config)
            .with_parse_options(ParseOptions::default())
            .execute(&[], &mut out, Cursor::new("b\n"))
            .unwrap();
        assert_eq!(code, 1);
        let text = fs::read_to_string(fx.dir.path().join("db/cmd/a")).unwrap();
        assert!(text.contains("NAME=hi\nBROKEN=1\n"));

        // now broken: the run is clean
        let mut out = Vec::new();
        assert_eq!(harness.execute(&[], &mut out, Cursor::new("")).unwrap(), 0);
    }

    #[test]
    fn json_report_is_one_document() {
        let fx = Fixture::new("echo hi");
        fx.write("db/cmd/a", HI);
        let mut config = fx.config.clone();
        config.json = true;
        let mut out = Vec::new();
        let code = Harness::new(config)
            .with_parse_options(ParseOptions::default())
            .execute(&[], &mut out, Cursor::new(""))
            .unwrap();
        assert_eq!(code, 0);
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["report"]["passed"], 1);
        assert_eq!(doc["results"][0]["name"], "hi");
    }

    #[test]
    fn fixed_records_are_unmarked() {
        let fx = Fixture::new("echo hi");
        let path = fx.write("db/cmd/a", &HI.replace("NAME=hi\n", "NAME=hi\nBROKEN=1\n"));
        let mut config = fx.config.clone();
        config.unmark_fixed = true;
        let code = Harness::new(config)
            .with_parse_options(ParseOptions::default())
            .execute(&[], Vec::new(), Cursor::new(""))
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(path).unwrap(), HI);
    }
}
