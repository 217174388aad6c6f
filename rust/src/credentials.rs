//! The hashed credential store (`username:hash` per line) read by the
//! daemon's authentication backend.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use sha_crypt::{sha512_check, sha512_simple, Sha512Params, ROUNDS_DEFAULT};
use std::io::{BufRead, BufReader, Write};

use crate::capstdext::perms_from_mode;
use crate::config::{HashingConfig, ServiceIdentity};

/// Mode of the installed store.
pub const STORE_MODE: u32 = 0o600;

const SHA512_PREFIX: &str = "$6$";
const ROUNDS_PREFIX: &str = "rounds=";

/// The rounds parameter encoded in a `$6$` hash; an absent `rounds=`
/// field means the default.
fn sha512_rounds(hash: &str) -> Option<usize> {
    let rest = hash.strip_prefix(SHA512_PREFIX)?;
    match rest.strip_prefix(ROUNDS_PREFIX) {
        Some(r) => r.split_once('$')?.0.parse().ok(),
        None => Some(ROUNDS_DEFAULT),
    }
}

/// Computes and checks SHA-512-crypt (`$6$`) hashes, the crypt(3) scheme
/// understood by the PAM password-file backends.
pub struct Hasher {
    rounds: usize,
    params: Sha512Params,
}

impl Hasher {
    pub fn new(config: &HashingConfig) -> Result<Self> {
        let params = Sha512Params::new(config.rounds)
            .map_err(|e| anyhow!("invalid hashing rounds {}: {e:?}", config.rounds))?;
        Ok(Self {
            rounds: config.rounds,
            params,
        })
    }

    /// Hash `secret` with a fresh random salt.
    pub fn hash(&self, secret: &str) -> Result<String> {
        sha512_simple(secret, &self.params).map_err(|e| anyhow!("hashing failed: {e:?}"))
    }

    /// Whether `hash` verifies `secret` and was computed with the current
    /// rounds, i.e. can be kept as is.
    pub fn is_current(&self, hash: &str, secret: &str) -> bool {
        if sha512_rounds(hash) != Some(self.rounds) {
            return false;
        }
        sha512_check(secret, hash).is_ok()
    }
}

/// Entry from the credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub username: String,
    pub hash: String,
}

impl CredentialEntry {
    /// Parse a single store entry.
    pub fn parse_line(s: impl AsRef<str>) -> Option<Self> {
        let (username, hash) = s.as_ref().split_once(':')?;
        if username.is_empty() || hash.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            hash: hash.to_string(),
        })
    }

    /// Serialize entry to writer, as a store line.
    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        std::writeln!(writer, "{}:{}", self.username, self.hash)
            .with_context(|| "failed to write credential entry")
    }
}

pub(crate) fn parse_store_content(content: impl BufRead) -> Result<Vec<CredentialEntry>> {
    let mut entries = vec![];
    for (line_num, line) in content.lines().enumerate() {
        let input = line
            .with_context(|| format!("failed to read credential entry at line {}", line_num))?;

        // Skip empty and comment lines
        if input.is_empty() || input.starts_with('#') {
            continue;
        }

        let entry = CredentialEntry::parse_line(&input).ok_or_else(|| {
            anyhow!("failed to parse credential entry at line {}", line_num)
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// An in-memory credential store, kept in insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CredentialStore {
    entries: Vec<CredentialEntry>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, username: impl Into<String>, hash: impl Into<String>) {
        self.entries.push(CredentialEntry {
            username: username.into(),
            hash: hash.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CredentialEntry] {
        &self.entries
    }

    /// Lookup the hash stored for `username`.
    pub fn get(&self, username: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.username == username)
            .map(|e| e.hash.as_str())
    }

    pub fn to_writer(&self, writer: &mut impl Write) -> Result<()> {
        for entry in &self.entries {
            entry.to_writer(writer)?;
        }
        Ok(())
    }

    /// Load a previously installed store, if any.
    #[context("Reading credential store {}", path)]
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        let f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entries = parse_store_content(BufReader::new(f))?;
        Ok(Some(Self { entries }))
    }

    /// Atomically replace the store at `path`: the content goes to a
    /// temporary file in the same directory which gets its mode and
    /// ownership before being renamed over the target.
    #[context("Installing credential store {}", path)]
    pub fn install(&self, path: &Utf8Path, identity: ServiceIdentity) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("credential store path has no file name"))?;
        let parent = match path.parent() {
            Some(p) if !p.as_str().is_empty() => p,
            _ => Utf8Path::new("."),
        };
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        dir.atomic_replace_with(name, |w| -> Result<()> {
            let f = w.get_mut().as_file_mut();
            f.set_permissions(perms_from_mode(STORE_MODE))?;
            std::os::unix::fs::fchown(&*f, Some(identity.uid), Some(identity.gid))?;
            self.to_writer(w)?;
            crate::try_fail_point!("credentials::install");
            Ok(())
        })?;
        tracing::debug!("installed {} credential entries to {path}", self.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    fn hasher() -> Hasher {
        Hasher::new(&HashingConfig::cheap()).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = hasher();
        let hash = hasher.hash("Secret1").unwrap();
        assert!(hash.starts_with("$6$"), "{hash}");
        assert_eq!(sha512_rounds(&hash), Some(HashingConfig::cheap().rounds));
        assert!(!hash.contains(':'));
        assert!(hasher.is_current(&hash, "Secret1"));
        assert!(!hasher.is_current(&hash, "Secret2"));
        assert!(!hasher.is_current("not-a-hash", "Secret1"));
        // Random salts
        assert_ne!(hash, hasher.hash("Secret1").unwrap());
    }

    #[test]
    fn test_known_vector() {
        // From the SHA-crypt reference test vectors; no rounds field.
        let hash = "$6$saltstring$svn8UoSVapNtMuq1ukKS4tPQd8iKwSMHWjl/O817G3uBnIFNjnQJuesI68u4OTLiBFdcbYEdFCoEOfaS35inz1";
        assert_eq!(sha512_rounds(hash), Some(ROUNDS_DEFAULT));
        let hasher = Hasher::new(&HashingConfig::default()).unwrap();
        assert!(hasher.is_current(hash, "Hello world!"));
        assert!(!hasher.is_current(hash, "Hello world"));
        assert!(!hasher.is_current("$argon2id$v=19$m=64,t=1,p=1$c2FsdA$aGFzaA", "x"));
    }

    #[test]
    fn test_changed_rounds_not_current() {
        let hash = hasher().hash("Secret1").unwrap();
        let stronger = Hasher::new(&HashingConfig { rounds: 20_000 }).unwrap();
        assert!(!stronger.is_current(&hash, "Secret1"));
        assert!(Hasher::new(&HashingConfig { rounds: 10 }).is_err());
    }

    #[test]
    fn test_system_crypt_verifies() -> Result<()> {
        let hash = hasher().hash("Secret1")?;
        let out = match std::process::Command::new("perl")
            .args(["-e", "print crypt($ARGV[0], $ARGV[1])", "Secret1", &hash])
            .output()
        {
            Ok(out) => out,
            // No perl, nothing to compare against
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        assert!(out.status.success());
        assert_eq!(String::from_utf8(out.stdout)?, hash);
        Ok(())
    }

    #[test]
    fn test_parse_store() {
        let content = "alice:$6$salt$abc\n\n# comment\nbob:$6$salt$def\n";
        let entries = parse_store_content(Cursor::new(content)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            CredentialEntry {
                username: "bob".into(),
                hash: "$6$salt$def".into()
            }
        );
        parse_store_content(Cursor::new("no separator\n")).unwrap_err();
        parse_store_content(Cursor::new(":empty\n")).unwrap_err();
    }

    #[test]
    fn test_install() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = camino::Utf8PathBuf::try_from(td.path().join("users.pwd"))?;
        assert!(CredentialStore::load(&path)?.is_none());

        let mut store = CredentialStore::new();
        store.push("alice", "$6$salt$abc");
        store.push("bob", "$6$salt$def");
        store.install(&path, ServiceIdentity::current())?;

        similar_asserts::assert_eq!(
            std::fs::read_to_string(&path)?,
            "alice:$6$salt$abc\nbob:$6$salt$def\n"
        );
        let meta = std::fs::metadata(&path)?;
        assert_eq!(meta.permissions().mode() & 0o777, STORE_MODE);
        assert_eq!(meta.uid(), ServiceIdentity::current().uid);

        let loaded = CredentialStore::load(&path)?.unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.get("bob"), Some("$6$salt$def"));
        assert_eq!(loaded.get("carol"), None);

        CredentialStore::new().install(&path, ServiceIdentity::current())?;
        assert_eq!(std::fs::read_to_string(&path)?, "");
        Ok(())
    }
}
