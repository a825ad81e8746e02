use crate::classify;
use crate::record::{Dialect, Encoding, TestRecord, Verdict};
use crate::token::encode_base64;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub passed: usize,
    pub failed_broken: usize,
    pub failed_regression: usize,
    pub fixed: usize,
    pub total_wall_time_ms: u64,
}

impl RunReport {
    fn count(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Ok => self.passed += 1,
            Verdict::Fixed => self.fixed += 1,
            Verdict::Broken => self.failed_broken += 1,
            Verdict::Regression => self.failed_regression += 1,
        }
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed_regression > 0)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} tests: {} OK, {} BR, {} XX, {} FX in {}ms",
            self.total,
            self.passed,
            self.failed_broken,
            self.failed_regression,
            self.fixed,
            self.total_wall_time_ms
        )
    }
}

/// Regressions waiting for triage, in settle order.
#[derive(Debug, Default)]
pub struct FailureQueue {
    records: VecDeque<TestRecord>,
}

impl FailureQueue {
    pub fn push(&mut self, record: TestRecord) {
        self.records.push_back(record);
    }

    pub fn pop(&mut self) -> Option<TestRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerOptions {
    /// `NOOK`: hide `[OK]` lines and clean per-file tallies.
    pub quiet_ok: bool,
    /// Show failure details for broken records too.
    pub verbose: bool,
    /// Machine output only: no per-record lines at all.
    pub json: bool,
}

#[derive(Debug, Default)]
struct FileTally {
    pending: usize,
    ok: usize,
    broken: usize,
    regressions: usize,
    fixed: usize,
}

struct State<W> {
    out: W,
    report: RunReport,
    files: HashMap<PathBuf, FileTally>,
    queue: FailureQueue,
    fixed: Vec<TestRecord>,
    results: Vec<TestRecord>,
}

/// What a finished run leaves behind for triage and un-marking.
pub struct Finished<W> {
    pub report: RunReport,
    pub queue: FailureQueue,
    pub fixed: Vec<TestRecord>,
    pub results: Vec<TestRecord>,
    pub out: W,
}

/// The single serialization point for results coming back from workers.
pub struct Ledger<W> {
    options: LedgerOptions,
    started: Instant,
    state: Mutex<State<W>>,
}

impl<W: Write + Send> Ledger<W> {
    pub fn new(out: W, options: LedgerOptions) -> Self {
        Self {
            options,
            started: Instant::now(),
            state: Mutex::new(State {
                out,
                report: RunReport::default(),
                files: HashMap::new(),
                queue: FailureQueue::default(),
                fixed: Vec::new(),
                results: Vec::new(),
            }),
        }
    }

    /// Announces that `count` records of `file` are about to be submitted.
    pub fn open_file(&self, file: &Path, count: usize) {
        let mut state = self.lock();
        state.files.entry(file.to_path_buf()).or_default().pending += count;
    }

    /// Writes a line outside of any record, such as a section banner.
    pub fn note(&self, line: &str) {
        if self.options.json {
            return;
        }
        let mut state = self.lock();
        emit(&mut state.out, &format!("{line}\n"));
    }

    pub fn settle(&self, mut record: TestRecord) -> Verdict {
        let verdict = classify::settle(&mut record);
        let mut text = String::new();
        if !self.options.json {
            if !(self.options.quiet_ok && verdict == Verdict::Ok) {
                text.push_str(&status_line(verdict, &record));
            }
            if !verdict.passed() && (verdict == Verdict::Regression || self.options.verbose) {
                text.push_str(&failure_detail(&record));
            }
        }

        let mut state = self.lock();
        state.report.count(verdict);
        let tally = state.files.entry(record.source.clone()).or_default();
        match verdict {
            Verdict::Ok => tally.ok += 1,
            Verdict::Fixed => tally.fixed += 1,
            Verdict::Broken => tally.broken += 1,
            Verdict::Regression => tally.regressions += 1,
        }
        tally.pending = tally.pending.saturating_sub(1);
        if tally.pending == 0 {
            let tally = state.files.remove(&record.source).unwrap_or_default();
            let noisy = tally.regressions > 0 || tally.fixed > 0;
            if !self.options.json && (!self.options.quiet_ok || noisy) {
                text.push_str(&tally_line(&record.source, &tally));
            }
        }
        emit(&mut state.out, &text);

        match verdict {
            Verdict::Regression => state.queue.push(record.clone()),
            Verdict::Fixed => state.fixed.push(record.clone()),
            Verdict::Ok | Verdict::Broken => {}
        }
        state.results.push(record);
        verdict
    }

    pub fn finish(self) -> Finished<W> {
        let total_wall_time_ms = elapsed_ms(self.started);
        let state = match self.state.into_inner() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut report = state.report;
        report.total_wall_time_ms = total_wall_time_ms;
        Finished {
            report,
            queue: state.queue,
            fixed: state.fixed,
            results: state.results,
            out: state.out,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<W>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn emit<W: Write>(out: &mut W, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        warn!("failed to write report output: {err}");
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub fn status_line(verdict: Verdict, record: &TestRecord) -> String {
    let path = record.path.as_deref().unwrap_or("");
    let duration = record
        .run
        .as_ref()
        .map(|r| format!("{}ms", r.duration_ms))
        .unwrap_or_default();
    format!(
        "{} {} {} {} {}\n",
        verdict.tag(),
        record.source.display(),
        record.name,
        path,
        duration
    )
}

fn tally_line(file: &Path, tally: &FileTally) -> String {
    format!(
        "[**] {:>30}   OK {:>4} BR {:>4} XX {:>4} FX {:>4}\n",
        file.display().to_string(),
        tally.ok,
        tally.broken,
        tally.regressions,
        tally.fixed
    )
}

/// Block that can be pasted over the record's expectation.
pub fn expectation_block(key: &str, actual: &str) -> String {
    let newline = if actual.is_empty() || actual.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    format!("{key}=<<EOF\n{actual}{newline}EOF\n")
}

pub fn failure_detail(record: &TestRecord) -> String {
    let mut text = String::new();
    let Some(run) = &record.run else {
        return text;
    };
    let outcome = record.outcome.unwrap_or_else(|| classify::classify(record));
    let _ = writeln!(text, "\n$ {}", run.argv.join(" "));
    if !record.script.is_empty() {
        let _ = writeln!(text, "{}", record.script.join("\n"));
    }
    if let Some(reason) = &run.forced {
        let _ = writeln!(text, "--> {reason}");
        return text;
    }
    let headers = outcome.stdout_failed && outcome.stderr_failed;
    if outcome.stdout_failed {
        if headers {
            text.push_str("--> stdout\n");
        }
        if let Some(expected) = &record.expected_stdout {
            let _ = writeln!(text, "--- expected\n{}", classify::normalize_output(expected));
        }
        let _ = writeln!(text, "+++ actual\n{}", classify::normalize_output(&run.stdout));
        match (record.dialect, record.encoding) {
            (Dialect::Command, Encoding::Base64) => {
                let _ = writeln!(text, "EXPECT64={}", encode_base64(&run.stdout));
            }
            (Dialect::Command, _) => text.push_str(&expectation_block("EXPECT", &run.stdout)),
            _ => {}
        }
    }
    if outcome.stderr_failed {
        if headers {
            text.push_str("--> stderr\n");
        }
        if let Some(expected) = &record.expected_stderr {
            let _ = writeln!(text, "--- expected\n{}", classify::normalize_output(expected));
        }
        let _ = writeln!(text, "+++ actual\n{}", classify::normalize_output(&run.stderr));
        text.push_str(&expectation_block("EXPECT_ERR", &run.stderr));
    }
    text
}

/// The `--json` document.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub report: RunReport,
    pub results: &'a [TestRecord],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RunResult;

    fn record(file: &str, name: &str, expected: &str, stdout: &str, broken: bool) -> TestRecord {
        let mut record = TestRecord::new(Dialect::Command, Path::new(file), 1);
        record.name = name.into();
        record.script = vec!["?e x".into()];
        record.expected_stdout = Some(expected.into());
        record.broken = broken;
        record.run = Some(RunResult {
            argv: vec!["radare2".into(), "-N".into()],
            stdout: stdout.into(),
            ..RunResult::default()
        });
        record
    }

    fn text(ledger: Ledger<Vec<u8>>) -> (Finished<Vec<u8>>, String) {
        let finished = ledger.finish();
        let text = String::from_utf8(finished.out.clone()).unwrap();
        (finished, text)
    }

    #[test]
    fn counts_and_queues_by_verdict() {
        let ledger = Ledger::new(Vec::new(), LedgerOptions::default());
        ledger.open_file(Path::new("db/cmd/a"), 4);
        ledger.settle(record("db/cmd/a", "ok", "x", "x", false));
        ledger.settle(record("db/cmd/a", "fx", "x", "x", true));
        ledger.settle(record("db/cmd/a", "br", "x", "y", true));
        ledger.settle(record("db/cmd/a", "xx", "x", "y", false));
        let (finished, out) = text(ledger);
        let r = finished.report;
        assert_eq!(
            (r.total, r.passed, r.fixed, r.failed_broken, r.failed_regression),
            (4, 1, 1, 1, 1)
        );
        assert_eq!(r.exit_code(), 1);
        assert_eq!(finished.queue.len(), 1);
        assert_eq!(finished.fixed[0].name, "fx");
        assert_eq!(finished.results.len(), 4);
        assert!(out.contains("[XX] db/cmd/a xx"));
        assert!(out.contains("EXPECT=<<EOF\ny\nEOF\n"));
        // broken failures stay quiet unless verbose
        assert_eq!(out.matches("$ radare2 -N").count(), 1);
        assert_eq!(out.matches("[**]").count(), 1);
        assert!(out.trim_end().ends_with("OK    1 BR    1 XX    1 FX    1"));
    }

    #[test]
    fn tally_waits_for_every_record_of_a_file() {
        let ledger = Ledger::new(Vec::new(), LedgerOptions::default());
        ledger.open_file(Path::new("db/cmd/a"), 2);
        ledger.open_file(Path::new("db/cmd/b"), 1);
        ledger.settle(record("db/cmd/a", "1", "x", "x", false));
        ledger.settle(record("db/cmd/b", "2", "x", "x", false));
        ledger.settle(record("db/cmd/a", "3", "x", "x", false));
        let (_, out) = text(ledger);
        let tallies: Vec<&str> = out.lines().filter(|l| l.starts_with("[**]")).collect();
        assert_eq!(tallies.len(), 2);
        assert!(tallies[0].contains("db/cmd/b"));
        assert!(tallies[1].contains("db/cmd/a"));
    }

    #[test]
    fn quiet_ok_hides_clean_output() {
        let options = LedgerOptions {
            quiet_ok: true,
            ..LedgerOptions::default()
        };
        let ledger = Ledger::new(Vec::new(), options);
        ledger.open_file(Path::new("db/cmd/a"), 1);
        ledger.settle(record("db/cmd/a", "ok", "x", "x", false));
        let (finished, out) = text(ledger);
        assert!(out.is_empty());
        assert_eq!(finished.report.exit_code(), 0);
    }

    #[test]
    fn json_mode_prints_nothing_and_serializes() {
        let options = LedgerOptions {
            json: true,
            ..LedgerOptions::default()
        };
        let ledger = Ledger::new(Vec::new(), options);
        ledger.open_file(Path::new("db/cmd/a"), 1);
        ledger.settle(record("db/cmd/a", "xx", "x", "y", false));
        let (finished, out) = text(ledger);
        assert!(out.is_empty());
        let doc = serde_json::to_value(JsonReport {
            report: finished.report,
            results: &finished.results,
        })
        .unwrap();
        assert_eq!(doc["report"]["failed_regression"], 1);
        assert_eq!(doc["results"][0]["outcome"]["verdict"], "XX");
    }

    #[test]
    fn base64_failures_suggest_expect64() {
        let mut r = record("db/cmd/a", "b64", "x", "y\n", false);
        r.encoding = Encoding::Base64;
        crate::classify::settle(&mut r);
        assert!(failure_detail(&r).contains("EXPECT64=eQo="));
    }
}
