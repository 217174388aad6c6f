//! The chroot tree below the data root: one directory per home subfolder
//! and one alias symlink per user whose name differs from its subfolder.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use std::path::Path;

use crate::capstdext::{dirbuilder_from_mode, perms_from_mode, CapStdDirExt, EntryKind};
use crate::config::ServiceIdentity;
use crate::registry::UserRecord;

/// Mode of every home directory.
pub const HOME_MODE: u32 = 0o755;

/// Conditions under which a user's directory binding is refused.
/// Existing entries are never removed to resolve them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("home '{0}' is a symlink")]
    HomeIsSymlink(String),
    #[error("home '{0}' exists and is not a directory")]
    HomeNotDirectory(String),
    #[error("alias '{0}' is taken by an entry that is not a symlink")]
    AliasOccupied(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeState {
    Created,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasState {
    /// The username equals the home subfolder.
    NotNeeded,
    Created,
    /// An alias pointing elsewhere was replaced.
    Updated,
    Unchanged,
}

/// The filesystem side of one provisioned user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBinding {
    pub username: String,
    pub home_subfolder: String,
    pub home: HomeState,
    pub alias: AliasState,
}

/// An opened data root together with the identity owning its content.
#[derive(Debug)]
pub struct DataRoot {
    path: Utf8PathBuf,
    dir: Dir,
    identity: ServiceIdentity,
}

impl DataRoot {
    /// Open the data root, creating it if needed.
    #[context("Opening data root {}", path)]
    pub fn open(path: &Utf8Path, identity: ServiceIdentity) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self {
            path: path.to_owned(),
            dir,
            identity,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn chown(&self, name: &str) -> Result<()> {
        let full = self.path.join(name);
        std::os::unix::fs::lchown(&full, Some(self.identity.uid), Some(self.identity.gid))
            .with_context(|| format!("Changing owner of {full}"))
    }

    /// Make sure `home` is a real directory with [`HOME_MODE`] owned by the
    /// service identity.
    #[context("Preparing home directory '{}'", home)]
    pub fn ensure_home(&self, home: &str) -> Result<HomeState> {
        let state = match self.dir.entry_kind(home)? {
            EntryKind::Missing => {
                if self.dir.ensure_dir_with(home, &dirbuilder_from_mode(HOME_MODE))? {
                    HomeState::Created
                } else {
                    HomeState::Existing
                }
            }
            EntryKind::Directory => HomeState::Existing,
            EntryKind::Symlink(_) => return Err(LayoutError::HomeIsSymlink(home.into()).into()),
            EntryKind::Other => return Err(LayoutError::HomeNotDirectory(home.into()).into()),
        };
        self.dir.set_permissions(home, perms_from_mode(HOME_MODE))?;
        self.chown(home)?;
        Ok(state)
    }

    /// Point the symlink `alias` at `home` (relative to the data root).
    #[context("Linking alias '{}' to '{}'", alias, home)]
    pub fn ensure_alias(&self, alias: &str, home: &str) -> Result<AliasState> {
        if alias == home {
            return Ok(AliasState::NotNeeded);
        }
        let state = match self.dir.entry_kind(alias)? {
            EntryKind::Missing => {
                self.dir.replace_symlink(home, alias)?;
                AliasState::Created
            }
            EntryKind::Symlink(target) if target == Path::new(home) => AliasState::Unchanged,
            EntryKind::Symlink(_) => {
                self.dir.replace_symlink(home, alias)?;
                AliasState::Updated
            }
            EntryKind::Directory | EntryKind::Other => {
                return Err(LayoutError::AliasOccupied(alias.into()).into())
            }
        };
        self.chown(alias)?;
        Ok(state)
    }

    /// Materialize the directory binding for `record`.
    pub fn bind(&self, record: &UserRecord) -> Result<DirectoryBinding> {
        let home = self.ensure_home(&record.home_subfolder)?;
        let alias = self.ensure_alias(&record.username, &record.home_subfolder)?;
        Ok(DirectoryBinding {
            username: record.username.clone(),
            home_subfolder: record.home_subfolder.clone(),
            home,
            alias,
        })
    }
}
