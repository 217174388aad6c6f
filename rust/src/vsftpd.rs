//! Rendering of the daemon configuration (`vsftpd.conf`).
//!
//! The file is generated from [`VsftpdConfig`] as a whole; the directives
//! that tie the daemon to the provisioned tree (guest mapping, chroot root,
//! PAM service) are derived from [`Config`] so they cannot drift apart.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use std::io::Write;

use crate::capstdext::perms_from_mode;
use crate::config::Config;

/// Mode of a written configuration file.
pub const CONFIG_FILE_MODE: u32 = 0o644;

/// Token vsftpd substitutes with the login name in `local_root`.
const USER_SUB_TOKEN: &str = "$USER";

/// Typed form of the directives we manage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsftpdConfig {
    pub listen_port: u16,
    pub guest_username: String,
    pub local_root: Utf8PathBuf,
    pub write_enable: bool,
    pub local_umask: String,
    pub pam_service_name: String,
    pub pasv_min_port: u16,
    pub pasv_max_port: u16,
    pub pasv_address: Option<String>,
    pub xferlog_file: Option<Utf8PathBuf>,
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "YES"
    } else {
        "NO"
    }
}

impl VsftpdConfig {
    pub fn from_config(config: &Config) -> Self {
        let opts = &config.vsftpd;
        Self {
            listen_port: opts.listen_port,
            guest_username: config.owner.clone(),
            local_root: config.data_root.join(USER_SUB_TOKEN),
            write_enable: opts.write_enable,
            local_umask: opts.local_umask.clone(),
            pam_service_name: opts.pam_service_name.clone(),
            pasv_min_port: opts.pasv_min_port,
            pasv_max_port: opts.pasv_max_port,
            pasv_address: opts.pasv_address.clone(),
            xferlog_file: opts.xferlog_file.clone(),
        }
    }

    /// All directives, in output order.
    fn directives(&self) -> Vec<(&'static str, String)> {
        let mut r = vec![
            ("listen", yes_no(true).to_string()),
            ("listen_ipv6", yes_no(false).to_string()),
            ("listen_port", self.listen_port.to_string()),
            ("background", yes_no(false).to_string()),
            ("anonymous_enable", yes_no(false).to_string()),
            ("local_enable", yes_no(true).to_string()),
            ("guest_enable", yes_no(true).to_string()),
            ("guest_username", self.guest_username.clone()),
            ("virtual_use_local_privs", yes_no(true).to_string()),
            ("write_enable", yes_no(self.write_enable).to_string()),
            ("local_umask", self.local_umask.clone()),
            ("user_sub_token", USER_SUB_TOKEN.to_string()),
            ("local_root", self.local_root.to_string()),
            ("chroot_local_user", yes_no(true).to_string()),
            ("allow_writeable_chroot", yes_no(true).to_string()),
            ("hide_ids", yes_no(true).to_string()),
            ("pam_service_name", self.pam_service_name.clone()),
            ("pasv_enable", yes_no(true).to_string()),
            ("pasv_min_port", self.pasv_min_port.to_string()),
            ("pasv_max_port", self.pasv_max_port.to_string()),
        ];
        if let Some(addr) = self.pasv_address.as_ref() {
            r.push(("pasv_address", addr.clone()));
        }
        r.push(("xferlog_enable", yes_no(self.xferlog_file.is_some()).to_string()));
        if let Some(f) = self.xferlog_file.as_ref() {
            r.push(("xferlog_std_format", yes_no(true).to_string()));
            r.push(("xferlog_file", f.to_string()));
        }
        r
    }

    pub fn to_writer(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "# Generated by ftp-vusers; local changes will be overwritten.")?;
        for (k, v) in self.directives() {
            writeln!(w, "{k}={v}")?;
        }
        Ok(())
    }

    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.to_writer(&mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Atomically write the configuration to `path`.
    #[context("Writing {}", path)]
    pub fn write_to(&self, path: &Utf8Path) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("output path has no file name"))?;
        let parent = match path.parent() {
            Some(p) if !p.as_str().is_empty() => p,
            _ => Utf8Path::new("."),
        };
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        dir.atomic_replace_with(name, |w| -> Result<()> {
            w.get_mut()
                .as_file_mut()
                .set_permissions(perms_from_mode(CONFIG_FILE_MODE))?;
            self.to_writer(w)
        })?;
        Ok(())
    }
}
