//! Line-level tokenizer for the key/value test grammar.
//!
//! The tokenizer owns every multi-line decision (heredoc scanning, terminator
//! validation) so that the record builder only ever sees whole fields.

use crate::error::{ParseError, ParseErrorKind};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::path::Path;

pub const TERMINATOR: &str = "EOF";
pub const RUN: &str = "RUN";

/// Keys whose value may be a `<<EOF` block.
pub const BLOCK_KEYS: [&str; 4] = ["CMDS", "EXPECT", "EXPECT_ERR", "FILE"];

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Inline(String),
    Block(Vec<String>),
}

impl Value {
    /// Block values keep one `\n` per line, inline values are returned as written.
    pub fn text(&self) -> String {
        match self {
            Value::Inline(v) => v.clone(),
            Value::Block(lines) => lines.iter().map(|l| format!("{l}\n")).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Run,
    /// A bare word such as `ONE_STREAM` or `BROKEN`.
    Flag(String),
    Field { key: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// 1-based line of the key.
    pub line: usize,
    /// 1-based line of the last physical line the token consumed.
    pub end_line: usize,
    pub kind: TokenKind,
}

pub fn tokenize(file: &Path, lines: &[String]) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let raw = &lines[i];
        let line_no = i + 1;
        let trimmed = raw.trim();
        i += 1;
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed == RUN {
            tokens.push(Token {
                line: line_no,
                end_line: line_no,
                kind: TokenKind::Run,
            });
            continue;
        }
        let Some(eq) = raw.find('=') else {
            if trimmed == TERMINATOR {
                return Err(ParseError::new(file, line_no, ParseErrorKind::StrayTerminator));
            }
            tokens.push(Token {
                line: line_no,
                end_line: line_no,
                kind: TokenKind::Flag(trimmed.to_string()),
            });
            continue;
        };
        let key = raw[..eq].to_string();
        let value = &raw[eq + 1..];
        let opener = value.trim().strip_prefix("<<");
        match opener {
            Some(token) if BLOCK_KEYS.contains(&key.as_str()) => {
                if token != TERMINATOR {
                    return Err(ParseError::new(
                        file,
                        line_no,
                        ParseErrorKind::BadTerminator(token.to_string()),
                    ));
                }
                let body_start = i;
                while i < lines.len() && !lines[i].starts_with(TERMINATOR) {
                    i += 1;
                }
                if i == lines.len() {
                    return Err(ParseError::new(file, line_no, ParseErrorKind::Unterminated(key)));
                }
                let body = lines[body_start..i].to_vec();
                i += 1;
                tokens.push(Token {
                    line: line_no,
                    end_line: i,
                    kind: TokenKind::Field {
                        key,
                        value: Value::Block(body),
                    },
                });
            }
            _ => tokens.push(Token {
                line: line_no,
                end_line: line_no,
                kind: TokenKind::Field {
                    key,
                    value: Value::Inline(value.to_string()),
                },
            }),
        }
    }
    Ok(tokens)
}

pub fn decode_base64(value: &str) -> Result<String, base64::DecodeError> {
    let bytes = LENIENT.decode(value.trim())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn encode_base64(text: &str) -> String {
    LENIENT.encode(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.split('\n').map(str::to_string).collect()
    }

    #[test]
    fn heredoc_becomes_one_block_token() {
        let tokens = tokenize(
            Path::new("t"),
            &lines("NAME=a\nCMDS=<<EOF\n?e hi\n# kept\nEOF\nRUN"),
        )
        .unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(
            tokens[1].kind,
            TokenKind::Field {
                key: "CMDS".into(),
                value: Value::Block(vec!["?e hi".into(), "# kept".into()]),
            }
        );
        assert_eq!((tokens[1].line, tokens[1].end_line), (2, 5));
        assert_eq!(tokens[2].kind, TokenKind::Run);
    }

    #[test]
    fn non_eof_terminator_is_fatal() {
        let err = tokenize(Path::new("t"), &lines("EXPECT=<<END\nx\nEND")).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::BadTerminator(ref t) if t == "END"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn unterminated_block_cites_opening_line() {
        let err = tokenize(Path::new("t"), &lines("NAME=a\n\nEXPECT=<<EOF\nx\n")).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::Unterminated(ref k) if k == "EXPECT"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn stray_terminator_is_fatal() {
        let err = tokenize(Path::new("t"), &lines("NAME=a\nEOF")).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::StrayTerminator));
    }

    #[test]
    fn bare_words_are_flags_and_heredoc_only_applies_to_block_keys() {
        let tokens = tokenize(Path::new("t"), &lines("ONE_STREAM\nNAME=<<EOF")).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Flag("ONE_STREAM".into()));
        assert_eq!(
            tokens[1].kind,
            TokenKind::Field {
                key: "NAME".into(),
                value: Value::Inline("<<EOF".into()),
            }
        );
    }

    #[test]
    fn base64_tolerates_missing_padding() {
        assert_eq!(decode_base64("aGk").unwrap(), "hi");
        assert_eq!(decode_base64(&encode_base64("pd 1\n")).unwrap(), "pd 1\n");
    }
}
