//! A provisioning pass: turn the registry into a fresh credential store and
//! the matching chroot tree.
//!
//! Problems with single lines or users never abort the pass; they are
//! collected into the [`ProvisionReport`]. Only an unreadable registry, an
//! unusable data root and a failed store install are fatal.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use fn_error_context::context;
use std::fmt;

use crate::config::{Config, ServiceIdentity};
use crate::credentials::{CredentialStore, Hasher};
use crate::layout::{DataRoot, DirectoryBinding};
use crate::registry::{ParsedRegistry, Registry, SkippedLine, UserRecord};

/// A well-formed record whose provisioning failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUser {
    pub username: String,
    pub line: usize,
    pub error: String,
}

/// Outcome of one provisioning pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub registry_missing: bool,
    pub provisioned: Vec<DirectoryBinding>,
    pub skipped: Vec<SkippedLine>,
    pub failed: Vec<FailedUser>,
    /// How many hashes were carried over from the previous store.
    pub reused_hashes: usize,
}

impl ProvisionReport {
    pub fn provisioned_count(&self) -> usize {
        self.provisioned.len()
    }

    /// True if every registry line was provisioned.
    pub fn is_clean(&self) -> bool {
        !self.registry_missing && self.skipped.is_empty() && self.failed.is_empty()
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Provisioned {} user(s); skipped {} line(s); {} user(s) failed",
            self.provisioned.len(),
            self.skipped.len(),
            self.failed.len()
        )?;
        if self.registry_missing {
            writeln!(f, "  registry not found, no users configured")?;
        }
        for s in &self.skipped {
            writeln!(f, "  line {}: skipped: {}", s.line, s.reason)?;
        }
        for u in &self.failed {
            writeln!(f, "  line {}: user '{}' failed: {}", u.line, u.username, u.error)?;
        }
        Ok(())
    }
}

/// Runs provisioning passes for one configuration.
pub struct Provisioner<'a> {
    config: &'a Config,
    identity: ServiceIdentity,
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner, resolving the configured service identity.
    pub fn new(config: &'a Config) -> Result<Self> {
        let identity = config.service_identity()?;
        Ok(Self::with_identity(config, identity))
    }

    pub fn with_identity(config: &'a Config, identity: ServiceIdentity) -> Self {
        Self { config, identity }
    }

    fn previous_store(&self) -> Option<CredentialStore> {
        match CredentialStore::load(&self.config.credential_store) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!("ignoring previous credential store: {e:#}");
                None
            }
        }
    }

    /// Run one full pass.
    #[context("Provisioning users from {}", self.config.registry)]
    pub fn run(&self) -> Result<ProvisionReport> {
        let registry = Registry::new(&self.config.registry);
        let mut report = ProvisionReport::default();
        let parsed = match registry.read()? {
            Some(parsed) => parsed,
            None => {
                tracing::warn!(
                    "registry {} not found; starting with no users",
                    registry.path()
                );
                report.registry_missing = true;
                ParsedRegistry::default()
            }
        };
        for s in &parsed.skipped {
            tracing::warn!("{}:{}: skipping line: {}", registry.path(), s.line, s.reason);
        }
        report.skipped = parsed.skipped;

        let hasher = Hasher::new(&self.config.hashing)?;
        let previous = self.previous_store();
        let root = DataRoot::open(&self.config.data_root, self.identity)?;

        let mut store = CredentialStore::new();
        for entry in parsed.entries {
            let record = &entry.record;
            let previous_hash = previous.as_ref().and_then(|p| p.get(&record.username));
            match provision_one(&root, &hasher, record, previous_hash) {
                Ok((binding, hash, reused)) => {
                    tracing::info!(
                        "provisioned '{}' -> {}/{}",
                        record.username,
                        root.path(),
                        record.home_subfolder
                    );
                    store.push(record.username.as_str(), hash);
                    report.reused_hashes += usize::from(reused);
                    report.provisioned.push(binding);
                }
                Err(e) => {
                    tracing::warn!("failed to provision '{}': {e:#}", record.username);
                    report.failed.push(FailedUser {
                        username: record.username.clone(),
                        line: entry.line,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        if let Some(parent) = self.config.credential_store.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
            }
        }
        store.install(&self.config.credential_store, self.identity)?;
        tracing::info!(
            "installed {} credential(s) to {}",
            store.len(),
            self.config.credential_store
        );
        Ok(report)
    }
}

/// Bind the directories for one user, then produce its hash. A user
/// without a chroot root never receives a credential.
fn provision_one(
    root: &DataRoot,
    hasher: &Hasher,
    record: &UserRecord,
    previous_hash: Option<&str>,
) -> Result<(DirectoryBinding, String, bool)> {
    let binding = root.bind(record)?;
    if let Some(hash) = previous_hash.filter(|h| hasher.is_current(h, &record.secret)) {
        return Ok((binding, hash.to_string(), true));
    }
    let hash = hasher
        .hash(&record.secret)
        .with_context(|| format!("Hashing secret for '{}'", record.username))?;
    Ok((binding, hash, false))
}
