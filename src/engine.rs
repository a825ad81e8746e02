use crate::record::{Dialect, RunResult, TestRecord};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Keeps the tool's output free of prompts, colors and UTF-8 art, and makes
/// it quit once the script is done.
pub const BASELINE_FLAGS: [&str; 5] = [
    "-escr.utf8=0",
    "-escr.color=0",
    "-escr.interactive=0",
    "-N",
    "-Q",
];
pub const ONE_STREAM_FLAG: &str = "-escr.onestream=1";
/// Set for every record outside the extras directories, removed inside them.
pub const NOPLUGIN_VARS: [&str; 3] = ["R2_NOPLUGINS", "RABIN2_NOPLUGINS", "RASM2_NOPLUGINS"];
pub const CORPUS_SCRIPT: &str = "?e init";
pub const DEFAULT_CORPUS_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptMode {
    /// Script written to a temporary file and passed with `-i`.
    #[default]
    File,
    /// Script joined with `;` and passed with `-c`.
    Inline,
}

#[derive(Debug, Clone)]
pub struct Engine {
    pub binary: PathBuf,
    pub mode: ScriptMode,
    pub corpus_timeout: Duration,
}

impl Engine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mode: ScriptMode::File,
            corpus_timeout: DEFAULT_CORPUS_TIMEOUT,
        }
    }

    /// Arguments after the binary name. `script` is the temporary script file
    /// in [`ScriptMode::File`] and ignored otherwise.
    pub fn argv(&self, record: &TestRecord, script: Option<&Path>) -> Vec<String> {
        if record.dialect == Dialect::Corpus {
            let mut argv: Vec<String> =
                vec!["-c".into(), CORPUS_SCRIPT.into(), "-qcq".into(), "-A".into()];
            argv.extend(record.target_files.iter().cloned());
            return argv;
        }
        let mut argv: Vec<String> = Vec::new();
        if record.one_stream {
            argv.push(ONE_STREAM_FLAG.into());
        }
        argv.extend(BASELINE_FLAGS.iter().map(|s| s.to_string()));
        argv.extend(record.arguments.iter().cloned());
        match (self.mode, script) {
            (ScriptMode::File, Some(path)) => {
                argv.push("-i".into());
                argv.push(path.to_string_lossy().into_owned());
            }
            _ => {
                argv.push("-c".into());
                argv.push(record.script.join(";"));
            }
        }
        argv.extend(record.target_files.iter().cloned());
        argv
    }

    /// Environment changes for one record; `None` removes the variable.
    pub fn env(&self, record: &TestRecord) -> Vec<(String, Option<String>)> {
        let mut env: Vec<(String, Option<String>)> = NOPLUGIN_VARS
            .iter()
            .map(|var| {
                let value = (!record.load_plugins).then(|| "1".to_string());
                (var.to_string(), value)
            })
            .collect();
        env.extend(
            record
                .custom_env
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone()))),
        );
        env
    }

    /// Runs one record and attaches its [`RunResult`]. Spawn failures of
    /// script records are returned; corpus records turn them into a forced
    /// failure since that is what they test for.
    pub fn execute(&self, record: &mut TestRecord) -> Result<()> {
        if record.dialect == Dialect::Corpus {
            self.execute_corpus(record);
            return Ok(());
        }

        let script_file = match self.mode {
            ScriptMode::File => Some(write_script(&record.script)?),
            ScriptMode::Inline => None,
        };
        let args = self.argv(record, script_file.as_ref().map(|f| f.path()));
        let mut command = self.command(record, &args);
        command.stdin(Stdio::null());

        let started = Instant::now();
        let captured = if record.one_stream {
            capture_merged(command)
        } else {
            capture_split(command)
        };
        let duration_ms = elapsed_ms(started);

        if let Some(file) = script_file {
            if let Err(err) = file.close() {
                warn!("failed to remove temporary script: {err}");
            }
        }
        let (stdout, stderr, exit_code) =
            captured.with_context(|| format!("running {}", self.binary.display()))?;
        debug!(
            "[CMD ] {} {:?} -> status {:?}, stdout {}B, stderr {}B",
            self.binary.display(),
            args,
            exit_code,
            stdout.len(),
            stderr.len()
        );
        record.run = Some(RunResult {
            argv: self.full_argv(args),
            stdout,
            stderr,
            exit_code,
            duration_ms,
            forced: None,
        });
        Ok(())
    }

    fn execute_corpus(&self, record: &mut TestRecord) {
        let args = self.argv(record, None);
        let mut command = self.command(record, &args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let started = Instant::now();
        record.run = Some(RunResult {
            argv: self.full_argv(args),
            ..RunResult::default()
        });

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                record.force_failure(format!("spawn failed: {err}"));
                return;
            }
        };
        let waited = wait_with_deadline(&mut child, self.corpus_timeout);
        if let Some(run) = record.run.as_mut() {
            run.duration_ms = elapsed_ms(started);
        }
        match waited {
            Ok(Some(status)) => {
                if let Some(run) = record.run.as_mut() {
                    run.exit_code = status.code();
                }
            }
            Ok(None) => record.force_failure(format!(
                "timed out after {}s",
                self.corpus_timeout.as_secs()
            )),
            Err(err) => record.force_failure(format!("wait failed: {err}")),
        }
    }

    fn command(&self, record: &TestRecord, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(args);
        for (key, value) in self.env(record) {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        command
    }

    fn full_argv(&self, args: Vec<String>) -> Vec<String> {
        let mut argv = vec![self.binary.to_string_lossy().into_owned()];
        argv.extend(args);
        argv
    }
}

fn write_script(script: &[String]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("r2r-")
        .suffix(".r2")
        .tempfile()
        .context("creating temporary script")?;
    file.write_all(script.join("\n").as_bytes())
        .context("writing temporary script")?;
    file.flush()?;
    Ok(file)
}

type Captured = (String, String, Option<i32>);

fn capture_split(mut command: Command) -> Result<Captured> {
    let child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let output = child.wait_with_output()?;
    Ok((
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
        output.status.code(),
    ))
}

// Both streams share one pipe so their interleaving is preserved.
fn capture_merged(mut command: Command) -> Result<Captured> {
    let (reader, writer) = nix::unistd::pipe().context("creating output pipe")?;
    command
        .stdout(Stdio::from(writer.try_clone()?))
        .stderr(Stdio::from(writer));
    let spawned = command.spawn();
    // The command still owns the parent's copies of the write end.
    drop(command);
    let mut child = spawned?;
    let mut bytes = Vec::new();
    File::from(reader).read_to_end(&mut bytes)?;
    let status = child.wait()?;
    Ok((
        String::from_utf8_lossy(&bytes).into_owned(),
        String::new(),
        status.code(),
    ))
}

/// `Ok(None)` when the deadline passed and the child was killed.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
