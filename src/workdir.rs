//! Workdir discovery and configuration.
//!
//! A workdir is any directory containing a `.tote/` control directory.
//! Discovery walks upward from a starting path; failure is a definite
//! error, surfaced before any command touches the store.
//!
//! `.tote/config` is an INI file.  The single key the core reads is
//! `path` in the `[store]` section; when present it is expanded for
//! `$VAR`/`${VAR}` and `~`, resolved relative to the workdir, and names the
//! blob store location.  When absent the store lives at `<workdir>/.tote`.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::checkin::most_recent_checkin;
use crate::error::{Error, Result};
use crate::scan::Ignore;
use crate::store::FileStore;

/// Does this directory contain a `.tote/` control directory?
pub fn is_workdir(path: &Path) -> bool {
    path.join(".tote").is_dir()
}

/// Search from `start` upward through parents for the first workdir.
pub fn find_workdir(start: &Path) -> Result<PathBuf> {
    let mut path = absolute(start)?;
    loop {
        if is_workdir(&path) {
            return Ok(path);
        }
        if !path.pop() {
            return Err(Error::NotAWorkdir(start.to_owned()));
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

/// A parsed INI file: `[section]` headers over `key = value` lines.
/// Both `=` and `:` delimiters are accepted; `#` and `;` start comments.
#[derive(Debug, Default)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    /// Load a config file.  A missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_owned();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let Some(split) = line.find(['=', ':']) else {
                continue;
            };
            let key = line[..split].trim().to_owned();
            let value = line[split + 1..].trim().to_owned();
            sections.entry(current.clone()).or_default().insert(key, value);
        }
        Self { sections }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }
}

// ── Expansion ────────────────────────────────────────────────────────────────

/// Expand `$VAR` and `${VAR}` from the environment; unknown variables are
/// left as written.
fn expand_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let rest = &value[i + 1..];
        let (name, consumed) = if let Some(body) = rest.strip_prefix('{') {
            match body.find('}') {
                Some(end) => (&body[..end], end + 2),
                None => {
                    out.push('$');
                    continue;
                }
            }
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            continue;
        }
        match env::var(name) {
            Ok(v) => out.push_str(&v),
            Err(_) => {
                out.push('$');
                out.push_str(&value[i + 1..i + 1 + consumed]);
            }
        }
        for _ in 0..consumed {
            chars.next();
        }
    }
    out
}

/// Expand a leading `~` to the home directory.
fn expand_home(value: &str) -> PathBuf {
    if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

// ── WorkDir ──────────────────────────────────────────────────────────────────

/// A discovered workspace: its root path and loaded configuration.
pub struct WorkDir {
    path: PathBuf,
    config: Config,
}

impl WorkDir {
    /// Attach to the workdir at `path`, or discover one from the current
    /// directory when no path is given.
    pub fn attach(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) if is_workdir(p) => absolute(p)?,
            Some(p) => return Err(Error::NotAWorkdir(p.to_owned())),
            None => find_workdir(Path::new("."))?,
        };
        let config = Config::load(&path.join(".tote/config"))?;
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The configured store path, expanded, or `None` when unset.
    pub fn store_path(&self) -> Option<PathBuf> {
        let raw = self.config.get("store", "path")?;
        let expanded = expand_home(&expand_vars(raw));
        if expanded.is_absolute() {
            Some(expanded)
        } else {
            Some(self.path.join(expanded))
        }
    }

    /// Attach to this workspace's blob store.
    pub fn store(&self) -> FileStore {
        match self.store_path() {
            Some(path) => FileStore::attach(path),
            None => FileStore::attach(self.path.join(".tote")),
        }
    }

    /// A fresh ignore engine rooted at this workspace.
    pub fn ignore(&self) -> Ignore {
        Ignore::new(&self.path)
    }

    pub fn most_recent_checkin(&self) -> Option<PathBuf> {
        most_recent_checkin(&self.path)
    }
}
