use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceText {
    pub lines: Vec<String>,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LineSource {
    platform: Platform,
}

impl LineSource {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    pub fn read(&self, path: &Path) -> Result<SourceText> {
        let blob = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        self.decode(&blob)
            .with_context(|| format!("decoding {}", path.display()))
    }

    pub fn decode(&self, blob: &[u8]) -> Result<SourceText> {
        let compressed = is_gzip(blob);
        let text = if compressed {
            let mut out = Vec::new();
            GzDecoder::new(blob).read_to_end(&mut out)?;
            String::from_utf8_lossy(&out).into_owned()
        } else {
            String::from_utf8_lossy(blob).into_owned()
        };
        let text = text.replace("\r\n", "\n");
        let lines = text
            .split('\n')
            .map(|line| match self.platform {
                Platform::Unix => line.to_string(),
                Platform::Windows => rewrite_windows_line(line),
            })
            .collect();
        Ok(SourceText { lines, compressed })
    }
}

pub fn is_gzip(blob: &[u8]) -> bool {
    blob.starts_with(&GZIP_MAGIC)
}

fn rewrite_windows_line(line: &str) -> String {
    let line = line.replace("/dev/null", "nul");
    let shell_line = ["!", "\"!", "CMDS=!", "CMDS=\"!"]
        .iter()
        .any(|prefix| line.starts_with(prefix));
    if !shell_line {
        return line;
    }
    rewrite_shell_vars(&line).replace("\\$", "$")
}

// `${NAME}` -> `%NAME%` for cmd.exe; names never contain whitespace.
fn rewrite_shell_vars(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 && !after[..end].contains(char::is_whitespace) => {
                out.push('%');
                out.push_str(&after[..end]);
                out.push('%');
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
