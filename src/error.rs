use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal grammar error: aborts the file it was found in.
#[derive(Debug, Error)]
#[error("{kind} at line {line} of {}", file.display())]
pub struct ParseError {
    pub file: PathBuf,
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error("unknown keyword \"{0}\"")]
    UnknownKey(String),
    #[error("unexpected \"EOF\"")]
    StrayTerminator,
    #[error("end token must be \"EOF\", got \"{0}\" instead")]
    BadTerminator(String),
    #[error("don't quote test name")]
    QuotedName,
    #[error("unexpected end-of-file in {0} -- did you forget an EOF?")]
    Unterminated(String),
    #[error("duplicate test name \"{name}\" (first seen at line {first_line} of {})", first_file.display())]
    DuplicateName {
        name: String,
        first_file: PathBuf,
        first_line: usize,
    },
    #[error("invalid base64 in {key}: {source}")]
    Base64 {
        key: String,
        source: base64::DecodeError,
    },
}

impl ParseError {
    pub fn new(file: &Path, line: usize, kind: ParseErrorKind) -> Self {
        Self {
            file: file.to_path_buf(),
            line,
            kind,
        }
    }

    /// Duplicate names poison the whole run, everything else only the file.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self.kind, ParseErrorKind::DuplicateName { .. })
    }
}

/// Recoverable problem: the offending line is skipped and parsing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: &Path, line: usize, message: impl Into<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
    }
}
