//! Configuration file handling.
//!
//! All locations and policies are read from a YAML file; every key has a
//! default so that an absent file yields a working setup for the stock
//! container image.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use nix::unistd::{Group, User};
use serde::{Deserialize, Serialize};

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "FTP_VUSERS_CONFIG";
/// Configuration file used when neither `--config` nor the environment say otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ftp-vusers/config.yaml";

const DEFAULT_REGISTRY: &str = "/etc/vsftpd/virtual_users.txt";
const DEFAULT_CREDENTIAL_STORE: &str = "/etc/vsftpd/virtual_users.pwd";
const DEFAULT_DATA_ROOT: &str = "/home/vsftpd";
const DEFAULT_SERVICE_ACCOUNT: &str = "ftp";

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// The `username|secret|home` registry.
    pub registry: Utf8PathBuf,
    /// Hashed credential store read by the authentication backend.
    pub credential_store: Utf8PathBuf,
    /// Parent of every per-user chroot directory.
    pub data_root: Utf8PathBuf,
    /// Owner of the data tree and credential store, by name or numeric id.
    pub owner: String,
    /// Group of the data tree and credential store, by name or numeric id.
    pub group: String,
    pub hashing: HashingConfig,
    pub reload: ReloadMethod,
    pub vsftpd: VsftpdOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.into(),
            credential_store: DEFAULT_CREDENTIAL_STORE.into(),
            data_root: DEFAULT_DATA_ROOT.into(),
            owner: DEFAULT_SERVICE_ACCOUNT.into(),
            group: DEFAULT_SERVICE_ACCOUNT.into(),
            hashing: HashingConfig::default(),
            reload: ReloadMethod::default(),
            vsftpd: VsftpdOptions::default(),
        }
    }
}

/// SHA-512-crypt cost.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct HashingConfig {
    pub rounds: usize,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            rounds: sha_crypt::ROUNDS_DEFAULT,
        }
    }
}

#[cfg(test)]
impl HashingConfig {
    /// Cheap parameters to keep tests fast.
    pub(crate) fn cheap() -> Self {
        Self {
            rounds: sha_crypt::ROUNDS_MIN,
        }
    }
}

/// How the running daemon is told to pick up registry changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(tag = "method", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ReloadMethod {
    /// Nothing is done; the operator restarts the service.
    #[default]
    None,
    /// Run a command, e.g. `["supervisorctl", "restart", "vsftpd"]`.
    Command { argv: Vec<String> },
    /// Send a signal to the process whose pid is stored in `pidfile`.
    Signal {
        pidfile: Utf8PathBuf,
        #[serde(default = "default_reload_signal")]
        signal: String,
    },
}

fn default_reload_signal() -> String {
    "SIGHUP".to_string()
}

/// Daemon settings that are not derived from the other sections.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct VsftpdOptions {
    pub listen_port: u16,
    pub pasv_min_port: u16,
    pub pasv_max_port: u16,
    pub pasv_address: Option<String>,
    pub pam_service_name: String,
    pub write_enable: bool,
    pub local_umask: String,
    pub xferlog_file: Option<Utf8PathBuf>,
}

impl Default for VsftpdOptions {
    fn default() -> Self {
        Self {
            listen_port: 21,
            pasv_min_port: 21100,
            pasv_max_port: 21110,
            pasv_address: None,
            pam_service_name: "vsftpd_virtual".to_string(),
            write_enable: true,
            local_umask: "022".to_string(),
            xferlog_file: Some("/var/log/vsftpd/xferlog".into()),
        }
    }
}

/// The uid/gid owning the data tree and the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl ServiceIdentity {
    /// The effective ids of the current process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
        }
    }
}

impl Config {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration. An explicit path must exist; otherwise
    /// `$FTP_VUSERS_CONFIG` and then [`DEFAULT_CONFIG_PATH`] are tried,
    /// falling back to built-in defaults.
    pub fn load(explicit: Option<&Utf8Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(Utf8PathBuf::from);
        let path = match explicit.map(ToOwned::to_owned).or(env_path) {
            Some(p) => p,
            None => {
                let p = Utf8PathBuf::from(DEFAULT_CONFIG_PATH);
                if !p.try_exists()? {
                    tracing::debug!("no configuration at {p}, using defaults");
                    return Ok(Self::default());
                }
                p
            }
        };
        Self::from_file(&path)
    }

    #[context("Loading configuration from {}", path)]
    pub fn from_file(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!("loaded configuration from {path}");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.registry.file_name().is_some(),
            "registry must name a file: {}",
            self.registry
        );
        anyhow::ensure!(
            self.credential_store.file_name().is_some(),
            "credential-store must name a file: {}",
            self.credential_store
        );
        anyhow::ensure!(
            self.vsftpd.pasv_min_port <= self.vsftpd.pasv_max_port,
            "vsftpd.pasv-min-port ({}) is above vsftpd.pasv-max-port ({})",
            self.vsftpd.pasv_min_port,
            self.vsftpd.pasv_max_port
        );
        if let ReloadMethod::Command { argv } = &self.reload {
            anyhow::ensure!(!argv.is_empty(), "reload command must not be empty");
        }
        sha_crypt::Sha512Params::new(self.hashing.rounds).map_err(|e| {
            anyhow!(
                "invalid hashing.rounds {}: {e:?}",
                self.hashing.rounds
            )
        })?;
        Ok(())
    }

    /// Resolve [`Config::owner`] and [`Config::group`] to numeric ids.
    #[context("Resolving service identity {}:{}", self.owner, self.group)]
    pub fn service_identity(&self) -> Result<ServiceIdentity> {
        let uid = match self.owner.parse::<u32>() {
            Ok(uid) => uid,
            Err(_) => User::from_name(&self.owner)?
                .ok_or_else(|| anyhow!("unknown user '{}'", self.owner))?
                .uid
                .as_raw(),
        };
        let gid = match self.group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => Group::from_name(&self.group)?
                .ok_or_else(|| anyhow!("unknown group '{}'", self.group))?
                .gid
                .as_raw(),
        };
        Ok(ServiceIdentity { uid, gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.registry, DEFAULT_REGISTRY);
        assert_eq!(config.reload, ReloadMethod::None);
        assert_eq!(config.hashing.rounds, 5000);
    }

    #[test]
    fn test_parse_full() {
        let config = Config::from_yaml(indoc::indoc! { r#"
            registry: /srv/users.txt
            credential-store: /srv/users.pwd
            data-root: /srv/ftp
            owner: "1000"
            group: "1001"
            hashing:
              rounds: 1000
            reload:
              method: signal
              pidfile: /run/vsftpd.pid
            vsftpd:
              pasv-address: 203.0.113.7
              write-enable: false
        "# })
        .unwrap();
        assert_eq!(config.data_root, "/srv/ftp");
        assert_eq!(config.hashing.rounds, 1000);
        assert_eq!(
            config.reload,
            ReloadMethod::Signal {
                pidfile: "/run/vsftpd.pid".into(),
                signal: "SIGHUP".into()
            }
        );
        assert_eq!(config.vsftpd.pasv_address.as_deref(), Some("203.0.113.7"));
        assert!(!config.vsftpd.write_enable);
        assert_eq!(config.vsftpd.listen_port, 21);
        assert_eq!(
            config.service_identity().unwrap(),
            ServiceIdentity {
                uid: 1000,
                gid: 1001
            }
        );
    }

    #[test]
    fn test_reload_command() {
        let config = Config::from_yaml(indoc::indoc! { r#"
            reload:
              method: command
              argv: [supervisorctl, restart, vsftpd]
        "# })
        .unwrap();
        let ReloadMethod::Command { argv } = config.reload else {
            panic!("expected a command reload");
        };
        assert_eq!(argv, ["supervisorctl", "restart", "vsftpd"]);
    }

    #[test]
    fn test_invalid() {
        let cases = [
            "unknown-key: 1",
            "reload: {method: command, argv: []}",
            "reload: {method: carrier-pigeon}",
            "vsftpd: {pasv-min-port: 30000, pasv-max-port: 20000}",
            "hashing: {rounds: 10}",
            "hashing: {memory-kib: 64}",
            "registry: /",
        ];
        for input in cases {
            Config::from_yaml(input).unwrap_err();
        }
    }

    #[test]
    fn test_unknown_owner() {
        let config = Config {
            owner: "no_such_user_for_ftp_vusers".into(),
            ..Default::default()
        };
        config.service_identity().unwrap_err();
    }
}
