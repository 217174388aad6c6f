//! The registry mutator: validate and append one user, then ask the running
//! service to re-provision.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use camino::Utf8PathBuf;
use std::io::Write;

use crate::registry::{AppendOutcome, MalformedReason, Registry, UserRecord};
use crate::reload::Reloader;

/// Exit code for rejected arguments.
pub const EXIT_INVALID: i32 = 3;
/// Exit code for a username that is already registered.
pub const EXIT_DUPLICATE: i32 = 4;
/// Exit code for a persisted record whose reload failed.
pub const EXIT_RELOAD_FAILED: i32 = 5;

/// Rejections and partial failures of `add-user` that map to their own exit
/// codes.
#[derive(Debug, thiserror::Error)]
pub enum AddUserError {
    #[error(transparent)]
    Invalid(#[from] MalformedReason),
    #[error("duplicate username '{username}' in {registry}")]
    DuplicateUsername {
        username: String,
        registry: Utf8PathBuf,
    },
    #[error("user '{username}' was added, but reloading failed (retry with `ftp-vusers reload`)")]
    ReloadFailed {
        username: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl AddUserError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AddUserError::Invalid(_) => EXIT_INVALID,
            AddUserError::DuplicateUsername { .. } => EXIT_DUPLICATE,
            AddUserError::ReloadFailed { .. } => EXIT_RELOAD_FAILED,
        }
    }
}

/// Append `username|secret|home_subfolder` to `registry` and trigger a
/// reload. Nothing is written unless all three values are valid and the
/// username is new. A confirmation goes to `out`.
pub fn add_user(
    registry: &Registry,
    username: &str,
    secret: &str,
    home_subfolder: &str,
    reloader: &dyn Reloader,
    out: &mut impl Write,
) -> Result<()> {
    let record = UserRecord::new(username, secret, home_subfolder).map_err(AddUserError::from)?;
    match registry.append(&record)? {
        AppendOutcome::Appended => {}
        AppendOutcome::Duplicate => {
            return Err(AddUserError::DuplicateUsername {
                username: record.username,
                registry: registry.path().to_owned(),
            }
            .into())
        }
    }
    writeln!(
        out,
        "Added user '{}' with home '{}'",
        record.username, record.home_subfolder
    )?;
    tracing::info!("reloading via {}", reloader.describe());
    reloader
        .reload()
        .map_err(|source| AddUserError::ReloadFailed {
            username: record.username.clone(),
            source: source.into(),
        })?;
    Ok(())
}
