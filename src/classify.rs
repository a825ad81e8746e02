use crate::record::{Dialect, Outcome, TestRecord, Verdict};

/// Strips carriage returns and at most one trailing newline.
pub fn normalize_output(text: &str) -> String {
    let text = text.replace('\r', "");
    match text.strip_suffix('\n') {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

pub fn stream_matches(expected: &str, actual: &str, trim: bool) -> bool {
    let expected = normalize_output(expected);
    let actual = normalize_output(actual);
    if trim {
        expected.trim() == actual.trim()
    } else {
        expected == actual
    }
}

fn is_json_or_empty(stdout: &str) -> bool {
    stdout.trim().is_empty() || serde_json::from_str::<serde_json::Value>(stdout).is_ok()
}

pub fn classify(record: &TestRecord) -> Outcome {
    let (stdout_failed, stderr_failed) = match &record.run {
        None => (true, true),
        Some(run) if run.forced.is_some() => (record.dialect != Dialect::Corpus, true),
        Some(run) => match record.dialect {
            Dialect::Corpus => (false, false),
            Dialect::Json => (!is_json_or_empty(&run.stdout), false),
            Dialect::Command | Dialect::Assembly => (
                record
                    .expected_stdout
                    .as_deref()
                    .is_some_and(|e| !stream_matches(e, &run.stdout, record.encoding.trims())),
                record
                    .expected_stderr
                    .as_deref()
                    .is_some_and(|e| !stream_matches(e, &run.stderr, false)),
            ),
        },
    };
    let passed = !stdout_failed && !stderr_failed;
    let verdict = match (passed, record.broken) {
        (true, false) => Verdict::Ok,
        (true, true) => Verdict::Fixed,
        (false, true) => Verdict::Broken,
        (false, false) => Verdict::Regression,
    };
    Outcome {
        verdict,
        stdout_failed,
        stderr_failed,
    }
}

/// Classifies a settled record and stores the outcome on it.
pub fn settle(record: &mut TestRecord) -> Verdict {
    let outcome = classify(record);
    record.outcome = Some(outcome);
    outcome.verdict
}
