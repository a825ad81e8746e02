use crate::record::Dialect;
use anyhow::{Context, Result};
use std::env::consts;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

pub const ARCHOS_DIR: &str = "archos";

/// Directory names that select a dialect. Anything else is a command test.
#[derive(Debug, Clone)]
pub struct DialectMap {
    roles: Vec<(String, Dialect)>,
}

impl Default for DialectMap {
    fn default() -> Self {
        Self {
            roles: vec![
                ("asm".into(), Dialect::Assembly),
                ("json".into(), Dialect::Json),
                ("fuzzed".into(), Dialect::Corpus),
            ],
        }
    }
}

impl DialectMap {
    pub fn new(roles: Vec<(String, Dialect)>) -> Self {
        Self { roles }
    }

    /// Matched against whole directory components, never substrings, so
    /// `db/rasm2/` stays a command directory.
    pub fn dialect_for(&self, relative: &Path) -> Dialect {
        let parent = relative.parent().unwrap_or(Path::new(""));
        for component in parent.components().rev() {
            let Component::Normal(name) = component else {
                continue;
            };
            let name = name.to_string_lossy();
            if let Some((_, dialect)) = self.roles.iter().find(|(role, _)| *role == name) {
                return *dialect;
            }
        }
        Dialect::Command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub dialect: Dialect,
    /// Lives under the extras directory: runs with plugins enabled.
    pub extras: bool,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub roles: DialectMap,
    pub filter: Option<String>,
    pub dialect: Option<Dialect>,
    pub extras_dir: String,
    /// `<os>-<arch>` directory name accepted under `archos/`.
    pub host: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            roles: DialectMap::default(),
            filter: None,
            dialect: None,
            extras_dir: "extras".into(),
            host: host_tag(),
        }
    }
}

impl Discovery {
    /// Walks `root` in file-name order, yielding files lazily. Only an
    /// unreadable root is an error; unreadable entries below it are logged.
    pub fn walk<'a>(&'a self, root: &Path) -> Result<impl Iterator<Item = Candidate> + 'a> {
        let meta =
            fs::metadata(root).with_context(|| format!("reading test root {}", root.display()))?;
        // Directory roles are resolved from the root's own name downwards.
        let base = match root.parent() {
            Some(parent) if meta.is_dir() => parent.to_path_buf(),
            _ => PathBuf::new(),
        };
        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        Ok(entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry: {err}");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            self.candidate(&base, entry.path())
        }))
    }

    /// Applies the skip rules to one file; `base` is stripped before
    /// directory roles are looked at.
    pub fn candidate(&self, base: &Path, path: &Path) -> Option<Candidate> {
        let shown = path.to_string_lossy();
        if let Some(filter) = &self.filter {
            if !shown.contains(filter.as_str()) {
                return None;
            }
        }
        let relative = path.strip_prefix(base).unwrap_or(path);
        let dirs: Vec<String> = relative
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(n) => Some(n.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let extras = dirs.iter().any(|d| *d == self.extras_dir);
        if extras && self.filter.is_none() {
            debug!("skipping {shown}: extras run only when filtered");
            return None;
        }
        if let Some(pos) = dirs.iter().position(|d| d == ARCHOS_DIR) {
            if let Some(platform) = dirs.get(pos + 1) {
                if *platform != self.host {
                    debug!("skipping {shown}: built for {platform}, host is {}", self.host);
                    return None;
                }
            }
        }

        let dialect = self.roles.dialect_for(relative);
        if self.dialect.is_some_and(|d| d != dialect) {
            return None;
        }
        Some(Candidate {
            path: path.to_path_buf(),
            dialect,
            extras,
        })
    }

    /// Whether the corpus directory should be loaded for this run.
    pub fn wants_corpus(&self) -> bool {
        let filter_ok = self
            .filter
            .as_deref()
            .map_or(true, |f| f.is_empty() || f == "fuzz");
        let dialect_ok = self.dialect.map_or(true, |d| d == Dialect::Corpus);
        filter_ok && dialect_ok
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// Host platform spelled the way `archos/` directories are named.
pub fn host_tag() -> String {
    let os = match consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };
    let arch = match consts::ARCH {
        "x86_64" => "x64",
        "x86" => "ia32",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}
