//! The virtual-user registry: a line-oriented `username|secret|home` file
//! edited by administrators and consumed by the provisioning pass.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use once_cell::sync::Lazy;
use regex::Regex;
use rustix::fs::{flock, FlockOperation};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

/// Separator between the three fields of a record.
pub const FIELD_SEPARATOR: char = '|';

/// Mode for a registry created by `add-user`; it holds clear text secrets.
const REGISTRY_MODE: u32 = 0o600;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_]+$").unwrap());

/// One of the three record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Username,
    Secret,
    HomeSubfolder,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Username => "username",
            Field::Secret => "secret",
            Field::HomeSubfolder => "home subfolder",
        };
        f.write_str(name)
    }
}

/// Why a registry line (or an `add-user` argument) was rejected.
///
/// None of these carry the secret, so they are safe to log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("expected 3 '|'-separated fields, found {0}")]
    WrongFieldCount(usize),
    #[error("empty {0} field")]
    EmptyField(Field),
    #[error("invalid username '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidUsername(String),
    #[error("invalid home subfolder '{0}': must be a single directory name")]
    InvalidHomeSubfolder(String),
    #[error("invalid secret: {0}")]
    InvalidSecret(&'static str),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("duplicate username '{username}', first defined at line {first_line}")]
    DuplicateUsername { username: String, first_line: usize },
}

/// Check a username against `^[A-Za-z0-9_]+$`.
pub fn validate_username(username: &str) -> Result<(), MalformedReason> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(MalformedReason::InvalidUsername(username.to_string()))
    }
}

/// A home subfolder must name exactly one entry directly below the data
/// root, otherwise a chroot could land outside of it.
pub fn validate_home_subfolder(home: &str) -> Result<(), MalformedReason> {
    let invalid = home.is_empty()
        || home == "."
        || home == ".."
        || home.contains('/')
        || home.contains('\0');
    if invalid {
        Err(MalformedReason::InvalidHomeSubfolder(home.to_string()))
    } else {
        Ok(())
    }
}

/// Secrets must survive a write/parse cycle unchanged.
pub fn validate_secret(secret: &str) -> Result<(), MalformedReason> {
    if secret.is_empty() {
        Err(MalformedReason::EmptyField(Field::Secret))
    } else if secret.contains(FIELD_SEPARATOR) {
        Err(MalformedReason::InvalidSecret("must not contain '|'"))
    } else if secret.contains(['\n', '\r']) {
        Err(MalformedReason::InvalidSecret("must not contain line breaks"))
    } else if secret.trim() != secret {
        Err(MalformedReason::InvalidSecret(
            "must not start or end with whitespace",
        ))
    } else {
        Ok(())
    }
}

/// A virtual user as declared in the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub secret: String,
    pub home_subfolder: String,
}

// Hand-written so that secrets never end up in logs.
impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("home_subfolder", &self.home_subfolder)
            .finish()
    }
}

impl UserRecord {
    /// Build a record from its parts, applying the same checks as the parser.
    pub fn new(username: &str, secret: &str, home_subfolder: &str) -> Result<Self, MalformedReason> {
        validate_username(username)?;
        validate_secret(secret)?;
        validate_home_subfolder(home_subfolder)?;
        Ok(Self {
            username: username.to_string(),
            secret: secret.to_string(),
            home_subfolder: home_subfolder.to_string(),
        })
    }

    /// Parse a single registry line. Blank and comment lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, MalformedReason> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = trimmed.split(FIELD_SEPARATOR).map(str::trim).collect();
        let [username, secret, home_subfolder] = fields.as_slice() else {
            return Err(MalformedReason::WrongFieldCount(fields.len()));
        };
        for (value, field) in [
            (username, Field::Username),
            (secret, Field::Secret),
            (home_subfolder, Field::HomeSubfolder),
        ] {
            if value.is_empty() {
                return Err(MalformedReason::EmptyField(field));
            }
        }
        validate_username(username)?;
        validate_home_subfolder(home_subfolder)?;

        Ok(Some(Self {
            username: username.to_string(),
            secret: secret.to_string(),
            home_subfolder: home_subfolder.to_string(),
        }))
    }

    /// Serialize the record to writer, as a registry line.
    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        std::writeln!(
            writer,
            "{}{sep}{}{sep}{}",
            self.username,
            self.secret,
            self.home_subfolder,
            sep = FIELD_SEPARATOR
        )
        .with_context(|| format!("failed to write registry entry for '{}'", self.username))
    }
}

/// A well-formed record and the (1-based) line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub line: usize,
    pub record: UserRecord,
}

/// A line that was rejected by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub line: usize,
    pub reason: MalformedReason,
}

/// Result of parsing a whole registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedRegistry {
    pub entries: Vec<RegistryEntry>,
    pub skipped: Vec<SkippedLine>,
}

impl ParsedRegistry {
    pub fn records(&self) -> impl Iterator<Item = &UserRecord> {
        self.entries.iter().map(|e| &e.record)
    }
}

/// Parse registry content. Only I/O errors are fatal; malformed lines end up
/// in [`ParsedRegistry::skipped`]. For duplicate usernames the first record
/// wins and every later one is reported.
pub fn parse_registry_content(content: impl BufRead) -> Result<ParsedRegistry> {
    let mut parsed = ParsedRegistry::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (idx, line) in content.split(b'\n').enumerate() {
        let line_num = idx + 1;
        let raw =
            line.with_context(|| format!("failed to read registry entry at line {}", line_num))?;
        let parsed_line = String::from_utf8(raw)
            .map_err(|_| MalformedReason::InvalidUtf8)
            .and_then(|s| UserRecord::parse_line(&s));
        let record = match parsed_line {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(reason) => {
                parsed.skipped.push(SkippedLine {
                    line: line_num,
                    reason,
                });
                continue;
            }
        };
        if let Some(&first_line) = seen.get(&record.username) {
            parsed.skipped.push(SkippedLine {
                line: line_num,
                reason: MalformedReason::DuplicateUsername {
                    username: record.username,
                    first_line,
                },
            });
            continue;
        }
        seen.insert(record.username.clone(), line_num);
        parsed.entries.push(RegistryEntry {
            line: line_num,
            record,
        });
    }
    Ok(parsed)
}

/// Field-anchored lookup of `username` in raw registry content. Any
/// non-comment line whose first field matches counts, even if the rest of
/// the line is malformed.
pub fn content_has_username(content: &[u8], username: &str) -> bool {
    content.split(|&b| b == b'\n').any(|line| {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        line.split(FIELD_SEPARATOR)
            .next()
            .map(str::trim)
            .is_some_and(|first| first == username)
    })
}

/// Outcome of [`Registry::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The username was already present; nothing was written.
    Duplicate,
}

/// Handle to the registry file on disk.
#[derive(Debug, Clone)]
pub struct Registry {
    path: Utf8PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Parse the whole registry under a shared lock. Returns `None` if the
    /// file does not exist.
    #[context("Reading registry {}", self.path)]
    pub fn read(&self) -> Result<Option<ParsedRegistry>> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        flock(&f, FlockOperation::LockShared).context("Locking registry")?;
        parse_registry_content(BufReader::new(f)).map(Some)
    }

    /// Append `record` unless its username is already present. The
    /// duplicate check and the write happen under one exclusive lock.
    #[context("Appending to registry {}", self.path)]
    pub fn append(&self, record: &UserRecord) -> Result<AppendOutcome> {
        let mut f = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .mode(REGISTRY_MODE)
            .open(&self.path)?;
        flock(&f, FlockOperation::LockExclusive).context("Locking registry")?;

        let mut existing = Vec::new();
        f.read_to_end(&mut existing)?;
        if content_has_username(&existing, &record.username) {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut buf = Vec::new();
        if existing.last().is_some_and(|&b| b != b'\n') {
            buf.push(b'\n');
        }
        record.to_writer(&mut buf)?;
        f.write_all(&buf)?;
        f.sync_all()?;
        tracing::debug!("appended '{}' to {}", record.username, self.path);
        Ok(AppendOutcome::Appended)
    }
}
