//! Interactive walk over the regressions of a run.

use crate::fix::Fixer;
use crate::report::{failure_detail, FailureQueue};
use crate::record::TestRecord;
use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::io::{BufRead, Write};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::warn;

pub const PROMPT: &str = "Wat du? (f)ix (i)gnore (b)roken (c)ommands (q)uit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Fix,
    Ignore,
    Broken,
    Commands,
    Quit,
}

impl Choice {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "f" => Some(Choice::Fix),
            "i" => Some(Choice::Ignore),
            "b" => Some(Choice::Broken),
            "c" => Some(Choice::Commands),
            "q" => Some(Choice::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageEnd {
    /// Queue drained or input closed.
    Finished,
    /// The user asked to quit.
    Aborted,
}

/// Replaces a script with an edited one.
pub type Editor<'a> = Box<dyn FnMut(&[String]) -> Result<Vec<String>> + 'a>;

pub struct Triage<'a, R, W> {
    fixer: &'a Fixer,
    input: R,
    output: W,
    editor: Editor<'a>,
}

impl<'a, R: BufRead, W: Write> Triage<'a, R, W> {
    pub fn new(fixer: &'a Fixer, input: R, output: W) -> Self {
        Self {
            fixer,
            input,
            output,
            editor: Box::new(external_editor),
        }
    }

    pub fn with_editor(mut self, editor: Editor<'a>) -> Self {
        self.editor = editor;
        self
    }

    pub fn run(&mut self, queue: &mut FailureQueue) -> Result<TriageEnd> {
        let total = queue.len();
        while let Some(record) = queue.pop() {
            writeln!(
                self.output,
                "\n[{}/{}] {} ({}:{})",
                total - queue.len(),
                total,
                record.name,
                record.source.display(),
                record.first_line
            )?;
            self.output.write_all(failure_detail(&record).as_bytes())?;
            match self.ask()? {
                None => return Ok(TriageEnd::Finished),
                Some(Choice::Quit) => {
                    writeln!(self.output, "Aborted")?;
                    return Ok(TriageEnd::Aborted);
                }
                Some(choice) => self.apply(choice, &record),
            }
        }
        Ok(TriageEnd::Finished)
    }

    /// Prompts until a known answer arrives. `None` means input closed.
    fn ask(&mut self) -> Result<Option<Choice>> {
        loop {
            writeln!(self.output, "{PROMPT}")?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if let Some(choice) = Choice::parse(&line) {
                return Ok(Some(choice));
            }
        }
    }

    // Fixer errors leave the record alone; triage moves on.
    fn apply(&mut self, choice: Choice, record: &TestRecord) {
        let result = match choice {
            Choice::Fix => self.fixer.fix(record),
            Choice::Broken => self.fixer.mark_broken(record),
            Choice::Commands => (self.editor)(&record.script)
                .and_then(|script| self.fixer.set_commands(record, &script)),
            Choice::Ignore | Choice::Quit => Ok(()),
        };
        if let Err(err) = result {
            warn!("{}: {err:#}", record.name);
        }
    }
}

/// Opens the script in `$EDITOR` (or `vi`) and reads it back.
pub fn external_editor(script: &[String]) -> Result<Vec<String>> {
    let mut file = NamedTempFile::with_prefix("r2r-cmds-")?;
    writeln!(file, "{}", script.join("\n"))?;
    file.flush()?;
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".into());
    let status = Command::new(&editor)
        .arg(file.path())
        .status()
        .with_context(|| format!("starting {editor}"))?;
    if !status.success() {
        bail!("{editor} exited with {status}");
    }
    let text = fs::read_to_string(file.path())?;
    Ok(text
        .lines()
        .map(str::to_string)
        .filter(|l| !l.trim().is_empty())
        .collect())
}
