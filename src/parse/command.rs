use super::{ParseOptions, ParsedFile};
use crate::error::{Diagnostic, ParseError, ParseErrorKind};
use crate::record::{Dialect, Encoding, TestRecord, EMPTY_TARGET};
use crate::token::{decode_base64, tokenize, Token, TokenKind, Value};
use std::collections::HashMap;
use std::path::Path;

pub fn parse(file: &Path, lines: &[String], opts: &ParseOptions) -> Result<ParsedFile, ParseError> {
    let mut builder = Builder::new(file, opts);
    for token in tokenize(file, lines)? {
        builder.feed(token)?;
    }
    Ok(builder.finish())
}

struct Pending {
    record: TestRecord,
    explicit_file: bool,
}

struct Builder<'a> {
    file: &'a Path,
    opts: &'a ParseOptions,
    current: Option<Pending>,
    seen: HashMap<String, usize>,
    out: ParsedFile,
}

impl<'a> Builder<'a> {
    fn new(file: &'a Path, opts: &'a ParseOptions) -> Self {
        Self {
            file,
            opts,
            current: None,
            seen: HashMap::new(),
            out: ParsedFile::default(),
        }
    }

    fn feed(&mut self, token: Token) -> Result<(), ParseError> {
        let line = token.line;
        match token.kind {
            TokenKind::Run => self.emit(line),
            TokenKind::Flag(word) => {
                let pending = self.pending(line);
                pending.record.last_line = line;
                match word.as_str() {
                    "BROKEN" => pending.record.broken = true,
                    "ONE_STREAM" => pending.record.one_stream = true,
                    _ => return Err(self.error(line, ParseErrorKind::UnknownKey(word))),
                }
                Ok(())
            }
            TokenKind::Field { key, value } => {
                self.pending(line).record.last_line = token.end_line;
                self.field(line, key, value)
            }
        }
    }

    fn pending(&mut self, line: usize) -> &mut Pending {
        let file = self.file;
        self.current.get_or_insert_with(|| Pending {
            record: TestRecord::new(Dialect::Command, file, line),
            explicit_file: false,
        })
    }

    fn field(&mut self, line: usize, key: String, value: Value) -> Result<(), ParseError> {
        let file = self.file;
        let decode = |text: &str| {
            decode_base64(text).map_err(|source| {
                ParseError::new(
                    file,
                    line,
                    ParseErrorKind::Base64 {
                        key: key.clone(),
                        source,
                    },
                )
            })
        };
        let ambient = &self.opts.ambient_env;
        let Some(pending) = self.current.as_mut() else {
            return Ok(());
        };
        let record = &mut pending.record;

        match key.as_str() {
            "NAME" => {
                let name = value.text();
                let trimmed = name.trim();
                if is_quoted(trimmed) {
                    return Err(ParseError::new(file, line, ParseErrorKind::QuotedName));
                }
                record.name = trimmed.to_string();
            }
            "PATH" => record.path = Some(value.text()),
            "ARGS" => {
                record.arguments = value.text().split_whitespace().map(str::to_string).collect()
            }
            "ARCH" => record.arch = Some(value.text().trim().to_string()),
            "BITS" => record.bits = Some(value.text().trim().to_string()),
            "CMDS" => record.script = script_lines(&value.text()),
            "CMDS64" => record.script = script_lines(&decode(&value.text())?),
            "EXPECT" => {
                record.expected_stdout = Some(expected_text(&value));
                record.encoding = Encoding::Text;
            }
            "EXPECT64" => {
                record.expected_stdout = Some(decode(&value.text())?);
                record.encoding = Encoding::Base64;
            }
            "EXPECT_ERR" => record.expected_stderr = Some(expected_err_text(&value)),
            "EXPECT_ERR64" => record.expected_stderr = Some(decode(&value.text())?),
            "FILE" => {
                pending.explicit_file = true;
                record.target_files = target_files(&value);
            }
            "BROKEN" => record.broken = value.text().trim() != "0",
            "ONE_STREAM" => record.one_stream = value.text().trim() != "0",
            _ => match key.strip_prefix('$') {
                Some(var) if !var.is_empty() => {
                    if !ambient.contains(var) {
                        record.custom_env.insert(var.to_string(), value.text());
                    }
                }
                _ => return Err(ParseError::new(file, line, ParseErrorKind::UnknownKey(key))),
            },
        }
        Ok(())
    }

    fn emit(&mut self, line: usize) -> Result<(), ParseError> {
        let Some(Pending { mut record, .. }) = self.current.take() else {
            self.diagnostic(line, "RUN without any fields, ignored");
            return Ok(());
        };
        record.last_line = line;
        if record.name.is_empty() {
            self.diagnostic(record.first_line, "record has no NAME, skipped");
            return Ok(());
        }
        if let Some(&first_line) = self.seen.get(&record.name) {
            return Err(self.error(
                record.first_line,
                ParseErrorKind::DuplicateName {
                    name: record.name,
                    first_file: self.file.to_path_buf(),
                    first_line,
                },
            ));
        }
        self.seen.insert(record.name.clone(), record.first_line);
        if !record.is_runnable() {
            let message = format!("record \"{}\" needs FILE and CMDS, skipped", record.name);
            self.diagnostic(record.first_line, message);
            return Ok(());
        }
        self.out.records.push(record);
        Ok(())
    }

    // A trailing block without RUN still runs when it names its file explicitly.
    fn finish(mut self) -> ParsedFile {
        if let Some(pending) = self.current.take() {
            let record = pending.record;
            let duplicate = self.seen.contains_key(&record.name);
            if pending.explicit_file && record.is_runnable() && !record.name.is_empty() && !duplicate
            {
                self.out.records.push(record);
            } else {
                self.diagnostic(record.first_line, "record is missing its RUN line, skipped");
            }
        }
        self.out
    }

    fn error(&self, line: usize, kind: ParseErrorKind) -> ParseError {
        ParseError::new(self.file, line, kind)
    }

    fn diagnostic(&mut self, line: usize, message: impl Into<String>) {
        self.out
            .diagnostics
            .push(Diagnostic::new(self.file, line, message));
    }
}

fn is_quoted(name: &str) -> bool {
    name.len() > 1
        && ((name.starts_with('\'') && name.ends_with('\''))
            || (name.starts_with('"') && name.ends_with('"')))
}

fn script_lines(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(str::to_string).collect()
}

fn expected_text(value: &Value) -> String {
    match value {
        Value::Inline(v) => format!("{v}\n"),
        Value::Block(_) => value.text(),
    }
}

fn expected_err_text(value: &Value) -> String {
    match value {
        Value::Inline(v) if v.is_empty() => String::new(),
        Value::Inline(v) => format!("{v}\n"),
        Value::Block(_) => value.text(),
    }
}

fn target_files(value: &Value) -> Vec<String> {
    let files: Vec<String> = match value {
        Value::Inline(v) => vec![v.trim().to_string()],
        Value::Block(lines) => lines.iter().map(|l| l.trim().to_string()).collect(),
    };
    let files: Vec<String> = files.into_iter().filter(|f| !f.is_empty()).collect();
    if files.is_empty() {
        vec![EMPTY_TARGET.to_string()]
    } else {
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.split('\n').map(str::to_string).collect()
    }

    fn parse_str(text: &str) -> Result<ParsedFile, ParseError> {
        parse(Path::new("db/cmd/t"), &lines(text), &ParseOptions::default())
    }

    #[test]
    fn full_record() {
        let parsed = parse_str(
            "NAME=hello\nFILE=-\nARGS=-a x86  -b 32\nCMDS=<<EOF\n?e hi\n?e there\nEOF\n\
             EXPECT=<<EOF\nhi\nthere\nEOF\nEXPECT_ERR=\nBROKEN=1\nONE_STREAM\n$R2R_TEST=1\nRUN",
        )
        .unwrap();
        assert!(parsed.diagnostics.is_empty());
        let r = &parsed.records[0];
        assert_eq!(r.name, "hello");
        assert_eq!(r.target_files, vec!["-"]);
        assert_eq!(r.arguments, vec!["-a", "x86", "-b", "32"]);
        assert_eq!(r.script, vec!["?e hi", "?e there"]);
        assert_eq!(r.expected_stdout.as_deref(), Some("hi\nthere\n"));
        assert_eq!(r.expected_stderr.as_deref(), Some(""));
        assert!(r.broken && r.one_stream);
        assert_eq!(r.custom_env.get("R2R_TEST").map(String::as_str), Some("1"));
        assert_eq!((r.first_line, r.last_line), (1, 16));
    }

    #[test]
    fn inline_expect_gets_trailing_newline() {
        let parsed = parse_str("NAME=a\nFILE=-\nCMDS=?e hi\nEXPECT=hi\nRUN").unwrap();
        assert_eq!(parsed.records[0].expected_stdout.as_deref(), Some("hi\n"));
        assert_eq!(parsed.records[0].encoding, Encoding::Text);
    }

    #[test]
    fn base64_fields_are_decoded() {
        // "?e hi\n" and "hi\n"
        let parsed =
            parse_str("NAME=a\nFILE=-\nCMDS64=P2UgaGkK\nEXPECT64=aGkK\nEXPECT_ERR64=\nRUN").unwrap();
        let r = &parsed.records[0];
        assert_eq!(r.script, vec!["?e hi"]);
        assert_eq!(r.expected_stdout.as_deref(), Some("hi\n"));
        assert_eq!(r.encoding, Encoding::Base64);
        assert_eq!(r.expected_stderr.as_deref(), Some(""));
    }

    #[test]
    fn ambient_env_wins() {
        let mut opts = ParseOptions::default();
        opts.ambient_env.insert("HOME".into());
        let parsed = parse(
            Path::new("t"),
            &lines("NAME=a\nFILE=-\nCMDS=?e\n$HOME=/tmp\n$FRESH=1\nRUN"),
            &opts,
        )
        .unwrap();
        let env = &parsed.records[0].custom_env;
        assert!(!env.contains_key("HOME"));
        assert_eq!(env.get("FRESH").map(String::as_str), Some("1"));
    }

    #[test]
    fn multi_line_file_block() {
        let parsed =
            parse_str("NAME=a\nFILE=<<EOF\nbins/elf/ls\n\nbins/pe/a.exe\nEOF\nCMDS=i\nRUN").unwrap();
        assert_eq!(
            parsed.records[0].target_files,
            vec!["bins/elf/ls", "bins/pe/a.exe"]
        );
    }

    #[test]
    fn unknown_key_is_fatal() {
        let err = parse_str("NAME=a\nEXPEKT=x\nRUN").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnknownKey(ref k) if k == "EXPEKT"));
        assert_eq!(err.line, 2);
        let err = parse_str("NAME=a\nWHATEVER\nRUN").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnknownKey(_)));
    }

    #[test]
    fn quoted_name_is_fatal() {
        let err = parse_str("NAME='quoted'\nRUN").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::QuotedName));
    }

    #[test]
    fn duplicate_name_in_one_file_is_fatal() {
        let err = parse_str(
            "NAME=foo\nFILE=-\nCMDS=?e 1\nRUN\n\nNAME=foo\nFILE=-\nCMDS=?e 2\nRUN",
        )
        .unwrap_err();
        assert!(err.is_run_fatal());
        assert_eq!(err.line, 6);
    }

    #[test]
    fn incomplete_records_are_skipped_with_diagnostics() {
        let parsed = parse_str("NAME=nocmds\nRUN\nFILE=-\nCMDS=?e\nRUN\nNAME=ok\nCMDS=?e\nRUN").unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].name, "ok");
        assert_eq!(parsed.diagnostics.len(), 2);
    }

    #[test]
    fn trailing_record_needs_explicit_file() {
        let parsed = parse_str("NAME=a\nFILE=bins/x\nCMDS=i").unwrap();
        assert_eq!(parsed.records.len(), 1);
        let parsed = parse_str("NAME=a\nCMDS=i").unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.diagnostics.len(), 1);
    }
}
