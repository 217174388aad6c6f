//! Helper functions for the [`cap-std` crate].
//!
//! [`cap-std` crate]: https://crates.io/crates/cap-std
//  SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io::{ErrorKind, Result};
use std::os::unix::prelude::PermissionsExt;
use std::path::Path;

use cap_std::fs::{Dir, DirBuilder, DirBuilderExt};
use cap_std_ext::dirext::CapStdExtDirExt;

/// What currently occupies a name inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Missing,
    Directory,
    /// A symlink and its (unresolved) target.
    Symlink(std::path::PathBuf),
    Other,
}

pub(crate) trait CapStdDirExt {
    /// Classify `p` without following symlinks.
    fn entry_kind(&self, p: impl AsRef<Path>) -> Result<EntryKind>;

    /// Point the symlink `link` at `target`, replacing an existing symlink
    /// through a rename so that `link` never disappears in between.
    fn replace_symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()>;
}

impl CapStdDirExt for Dir {
    fn entry_kind(&self, p: impl AsRef<Path>) -> Result<EntryKind> {
        let p = p.as_ref();
        let Some(meta) = self.symlink_metadata_optional(p)? else {
            return Ok(EntryKind::Missing);
        };
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink(self.read_link_contents(p)?)
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Other
        };
        Ok(kind)
    }

    fn replace_symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
        let link = link.as_ref();
        let name = link
            .file_name()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "invalid link name"))?;
        let mut tmpname = std::ffi::OsString::from(".");
        tmpname.push(name);
        tmpname.push(".tmp");
        let tmp = link.with_file_name(tmpname);
        self.remove_file_optional(&tmp)?;
        self.symlink(target, &tmp)?;
        self.rename(&tmp, self, link)
    }
}

pub(crate) fn dirbuilder_from_mode(m: u32) -> DirBuilder {
    let mut r = DirBuilder::new();
    r.mode(m);
    r
}

pub(crate) fn perms_from_mode(m: u32) -> cap_std::fs::Permissions {
    cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    #[test]
    fn test_entry_kind() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        assert_eq!(td.entry_kind("sub")?, EntryKind::Missing);
        td.create_dir_with("sub", &dirbuilder_from_mode(0o755))?;
        assert_eq!(td.entry_kind("sub")?, EntryKind::Directory);
        td.write("file", "x")?;
        assert_eq!(td.entry_kind("file")?, EntryKind::Other);
        Ok(())
    }

    #[test]
    fn test_replace_symlink() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        assert_eq!(td.entry_kind("link")?, EntryKind::Missing);
        td.replace_symlink("first", "link")?;
        assert_eq!(td.entry_kind("link")?, EntryKind::Symlink("first".into()));
        td.replace_symlink("second", "link")?;
        assert_eq!(td.entry_kind("link")?, EntryKind::Symlink("second".into()));
        assert_eq!(td.entry_kind(".link.tmp")?, EntryKind::Missing);
        Ok(())
    }
}
