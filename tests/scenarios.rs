use r2r::config::HarnessConfig;
use r2r::error::ParseError;
use r2r::harness::Harness;
use r2r::parse::ParseOptions;
use r2r::record::{Dialect, Verdict};
use r2r::report::Finished;
use std::fs;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A radare2 stand-in: logs its argv, then answers every `?e` line of the
/// `-i` script.
const ECHO_STUB: &str = r#"echo "$@" >> "$LOG"
script=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-i" ]; then script="$arg"; fi
  prev="$arg"
done
if [ -n "$script" ]; then
  echo "$script" >> "$SCRIPTS"
  sed -n 's/^?e //p' "$script"
fi"#;

struct Suite {
    dir: TempDir,
    binary: PathBuf,
}

impl Suite {
    fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("radare2");
        let log = dir.path().join("argv.log");
        let scripts = dir.path().join("scripts.log");
        let text = format!(
            "#!/bin/sh\nLOG='{}'\nSCRIPTS='{}'\n{body}\n",
            log.display(),
            scripts.display()
        );
        fs::write(&binary, text).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, binary }
    }

    fn write(&self, rel: &str, text: &str) -> PathBuf {
        let path = self.dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    fn config(&self) -> HarnessConfig {
        HarnessConfig {
            binary: self.binary.clone(),
            db: self.dir.path().join("db"),
            corpus_dir: self.dir.path().join("bins/fuzzed"),
            ..HarnessConfig::default()
        }
    }

    fn harness(&self) -> Harness {
        Harness::new(self.config()).with_parse_options(ParseOptions::default())
    }

    fn run(&self) -> Finished<Vec<u8>> {
        self.harness().run(&[], Vec::new()).unwrap()
    }

    fn log(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }
}

const HI: &str = "NAME=hi\nFILE=-\nCMDS=<<EOF\n?e hi\nEOF\nEXPECT=<<EOF\nhi\nEOF\nRUN\n";

#[test]
fn matching_output_is_ok() {
    let suite = Suite::new(ECHO_STUB);
    suite.write("db/cmd/hi", HI);
    let finished = suite.run();
    assert_eq!(finished.results.len(), 1);
    assert_eq!(finished.results[0].verdict(), Some(Verdict::Ok));
    assert_eq!(finished.report.exit_code(), 0);
    let out = String::from_utf8(finished.out).unwrap();
    assert!(out.starts_with("[OK] "));
}

#[test]
fn broken_mismatch_does_not_fail_the_run() {
    let suite = Suite::new("echo bye");
    suite.write("db/cmd/hi", &HI.replace("NAME=hi\n", "NAME=hi\nBROKEN=1\n"));
    let mut out = Vec::new();
    let code = suite.harness().execute(&[], &mut out, Cursor::new("")).unwrap();
    assert_eq!(code, 0);
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("[BR]"));
    assert!(text.contains("1 tests: 0 OK, 1 BR, 0 XX, 0 FX"));
}

#[test]
fn assembly_line_assembles_with_target_arguments() {
    let suite = Suite::new("echo b801000000");
    suite.write("db/asm/x86_32_32", "a \"mov eax, 1\" b801000000\n");
    let finished = suite.run();
    assert_eq!(finished.results.len(), 1);
    let record = &finished.results[0];
    assert_eq!(record.dialect, Dialect::Assembly);
    assert!(record.name.ends_with("(assemble)"));
    assert!(record.arguments.iter().any(|a| a == "asm.arch=x86"));
    assert!(record.arguments.iter().any(|a| a == "asm.bits=32"));
    assert_eq!(record.verdict(), Some(Verdict::Ok));
}

#[test]
fn duplicate_name_aborts_before_anything_runs() {
    let suite = Suite::new(ECHO_STUB);
    suite.write("db/cmd/dup", &format!("{}\n{}", HI.replace("hi", "foo"), HI.replace("hi", "foo")));
    let err = suite.harness().run(&[], Vec::new()).err().unwrap();
    let parse = err.downcast_ref::<ParseError>().unwrap();
    assert!(parse.is_run_fatal());
    assert!(parse.to_string().contains("\"foo\""));
    assert!(suite.log("argv.log").is_empty());
}

#[test]
fn one_stream_merges_stderr_into_stdout() {
    let suite = Suite::new("echo out\necho err >&2");
    let record = "NAME=merged\nFILE=-\nCMDS=?e\nONE_STREAM\nEXPECT=<<EOF\nout\nerr\nEOF\nRUN\n";
    suite.write("db/cmd/streams", record);
    suite.write("db/cmd/split", &record.replace("merged", "split").replace("ONE_STREAM\n", ""));
    let finished = suite.run();
    let by_name = |name: &str| finished.results.iter().find(|r| r.name == name).unwrap();
    let merged = by_name("merged");
    assert_eq!(merged.verdict(), Some(Verdict::Ok));
    assert_eq!(merged.stderr(), "");
    assert_eq!(merged.run.as_ref().unwrap().argv[1], "-escr.onestream=1");
    let split = by_name("split");
    assert_eq!(split.verdict(), Some(Verdict::Regression));
    assert_eq!(split.stderr(), "err\n");
}

#[test]
fn temporary_scripts_are_removed() {
    let suite = Suite::new(ECHO_STUB);
    suite.write("db/cmd/hi", HI);
    suite.write("db/cmd/bye", &HI.replace("hi", "bye"));
    let finished = suite.run();
    assert_eq!(finished.report.passed, 2);
    let scripts = suite.log("scripts.log");
    let paths: Vec<&str> = scripts.lines().collect();
    assert_eq!(paths.len(), 2);
    for path in paths {
        assert!(path.contains("r2r-"));
        assert!(!Path::new(path).exists(), "{path} left behind");
    }
}

#[test]
fn inline_mode_joins_script() {
    let suite = Suite::new(ECHO_STUB);
    suite.write("db/cmd/hi", "NAME=two\nFILE=-\nCMDS=<<EOF\n?e a\n?e b\nEOF\nRUN\n");
    let mut config = suite.config();
    config.script_mode = r2r::engine::ScriptMode::Inline;
    Harness::new(config).run(&[], Vec::new()).unwrap();
    assert!(suite.log("argv.log").contains("-c ?e a;?e b -"));
    assert!(suite.log("scripts.log").is_empty());
}

#[test]
fn plugins_are_disabled_outside_extras() {
    let suite = Suite::new("echo \"${R2_NOPLUGINS:-unset}\"");
    suite.write("db/cmd/env", "NAME=env\nFILE=-\nCMDS=?e\nEXPECT=<<EOF\n1\nEOF\nRUN\n");
    suite.write(
        "db/extras/env",
        "NAME=env-extras\nFILE=-\nCMDS=?e\nEXPECT=<<EOF\nunset\nEOF\nRUN\n",
    );
    // extras are skipped without a filter
    assert_eq!(suite.run().report.passed, 1);

    let mut config = suite.config();
    config.filter = Some("env".into());
    let finished = Harness::new(config)
        .with_parse_options(ParseOptions::default())
        .run(&[], Vec::new())
        .unwrap();
    assert_eq!(finished.report.passed, 2);
}

#[test]
fn custom_env_reaches_the_tool() {
    let suite = Suite::new("echo \"$R2R_SCENARIO_VAR\"");
    suite.write(
        "db/cmd/env",
        "NAME=env\nFILE=-\nCMDS=?e\n$R2R_SCENARIO_VAR=set\nEXPECT=<<EOF\nset\nEOF\nRUN\n",
    );
    assert_eq!(suite.run().report.passed, 1);
}
