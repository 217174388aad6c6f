//! Command line interface.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Serialize;
use std::io::Write;

use crate::adduser::{add_user, AddUserError};
use crate::config::Config;
use crate::provision::Provisioner;
use crate::registry::{ParsedRegistry, Registry};
use crate::vsftpd::VsftpdConfig;

/// Name under which the binary behaves as `ftp-vusers add-user`.
pub const ADD_USER_MULTICALL: &str = "add-user";

#[derive(Debug, Parser)]
#[clap(name = "ftp-vusers", version, rename_all = "kebab-case")]
/// Manage the virtual users of a chrooted FTP daemon
pub struct Cli {
    /// Configuration file (default: $FTP_VUSERS_CONFIG, then /etc/ftp-vusers/config.yaml)
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Cmd {
    /// Rebuild the credential store and the directory tree from the registry.
    Provision,
    /// Register a new user and reload the service.
    AddUser {
        /// Login name (ASCII letters, digits and '_')
        username: String,
        /// Clear text secret
        secret: String,
        /// Directory below the data root used as chroot
        home_subfolder: String,
    },
    /// List registered users, without secrets.
    List {
        /// Output JSON
        #[clap(long)]
        json: bool,
    },
    /// Report malformed and duplicate registry lines.
    Check,
    /// Generate the daemon configuration file.
    RenderConfig {
        /// Write here instead of stdout
        #[clap(long, short, value_name = "PATH")]
        output: Option<Utf8PathBuf>,
    },
    /// Ask the running service to re-provision.
    Reload,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct ListedUser<'a> {
    username: &'a str,
    home_subfolder: &'a str,
    line: usize,
}

fn read_registry(config: &Config) -> Result<(Registry, Option<ParsedRegistry>)> {
    let registry = Registry::new(&config.registry);
    let parsed = registry.read()?;
    Ok((registry, parsed))
}

impl Cmd {
    fn run(self, config: &Config, out: &mut impl Write) -> Result<i32> {
        match self {
            Cmd::Provision => {
                let report = Provisioner::new(config)?.run()?;
                write!(out, "{report}")?;
            }
            Cmd::AddUser {
                username,
                secret,
                home_subfolder,
            } => {
                let registry = Registry::new(&config.registry);
                let reloader = crate::reload::from_config(&config.reload)?;
                add_user(
                    &registry,
                    &username,
                    &secret,
                    &home_subfolder,
                    reloader.as_ref(),
                    out,
                )?;
            }
            Cmd::List { json } => {
                let (_, parsed) = read_registry(config)?;
                let parsed = parsed.unwrap_or_default();
                let users: Vec<_> = parsed
                    .entries
                    .iter()
                    .map(|e| ListedUser {
                        username: &e.record.username,
                        home_subfolder: &e.record.home_subfolder,
                        line: e.line,
                    })
                    .collect();
                if json {
                    serde_json::to_writer_pretty(&mut *out, &users)?;
                    writeln!(out)?;
                } else {
                    for u in users {
                        writeln!(out, "{}\t{}", u.username, u.home_subfolder)?;
                    }
                }
            }
            Cmd::Check => {
                let (registry, parsed) = read_registry(config)?;
                let Some(parsed) = parsed else {
                    writeln!(out, "{}: not found", registry.path())?;
                    return Ok(1);
                };
                for s in &parsed.skipped {
                    writeln!(out, "{}:{}: {}", registry.path(), s.line, s.reason)?;
                }
                writeln!(
                    out,
                    "{} valid user(s), {} problem(s)",
                    parsed.entries.len(),
                    parsed.skipped.len()
                )?;
                if !parsed.skipped.is_empty() {
                    return Ok(1);
                }
            }
            Cmd::RenderConfig { output } => {
                let rendered = VsftpdConfig::from_config(config);
                match output {
                    Some(path) => rendered.write_to(&path)?,
                    None => rendered.to_writer(out)?,
                }
            }
            Cmd::Reload => {
                let reloader = crate::reload::from_config(&config.reload)?;
                tracing::info!("reloading via {}", reloader.describe());
                reloader.reload()?;
            }
        }
        Ok(0)
    }
}

/// Rewrite the arguments of a multi-call invocation as `add-user` into the
/// equivalent subcommand form.
fn normalize_args(mut args: Vec<String>) -> Vec<String> {
    let invoked_as = args
        .first()
        .and_then(|a| Utf8Path::new(a).file_name())
        .map(ToOwned::to_owned);
    if invoked_as.as_deref() == Some(ADD_USER_MULTICALL) {
        args.insert(1, ADD_USER_MULTICALL.to_string());
    }
    args
}

/// Map an error to the process exit code.
pub fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<AddUserError>()
        .map(AddUserError::exit_code)
        .unwrap_or(1)
}

fn run_with_output(args: Vec<String>, out: &mut impl Write) -> Result<i32> {
    let cli = Cli::parse_from(normalize_args(args));
    let config = Config::load(cli.config.as_deref())?;
    cli.cmd.run(&config, out)
}

/// Parse `args` (including argv0) and run the selected command.
pub fn run_from_args(args: Vec<String>) -> Result<i32> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let r = run_with_output(args, &mut out)?;
    out.flush()?;
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse() {
        let cli = Cli::try_parse_from(["ftp-vusers", "provision"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::Provision));
        assert!(cli.config.is_none());

        let cli =
            Cli::try_parse_from(["ftp-vusers", "list", "--json", "--config", "/tmp/c.yaml"])
                .unwrap();
        assert!(matches!(cli.cmd, Cmd::List { json: true }));
        assert_eq!(cli.config.as_deref(), Some(Utf8Path::new("/tmp/c.yaml")));

        let cli = Cli::try_parse_from(["ftp-vusers", "add-user", "bob", "pw", "site_b"]).unwrap();
        match cli.cmd {
            Cmd::AddUser {
                username,
                secret,
                home_subfolder,
            } => {
                assert_eq!(username, "bob");
                assert_eq!(secret, "pw");
                assert_eq!(home_subfolder, "site_b");
            }
            o => panic!("Unexpected {o:?}"),
        }
    }

    #[test]
    fn test_usage_errors() {
        for bad in [
            &["ftp-vusers"][..],
            &["ftp-vusers", "add-user", "bob", "pw"],
            &["ftp-vusers", "add-user", "bob", "pw", "site", "extra"],
            &["ftp-vusers", "provision", "extra"],
        ] {
            let e = Cli::try_parse_from(bad).unwrap_err();
            assert_eq!(e.exit_code(), 2, "{bad:?}");
        }
    }

    #[test]
    fn test_multicall() {
        let normalized = normalize_args(args(&["/usr/local/bin/add-user", "bob", "pw", "b"]));
        assert_eq!(normalized, args(&["/usr/local/bin/add-user", "add-user", "bob", "pw", "b"]));
        let cli = Cli::try_parse_from(normalized).unwrap();
        assert!(matches!(cli.cmd, Cmd::AddUser { .. }));
        let unchanged = args(&["ftp-vusers", "check"]);
        assert_eq!(normalize_args(unchanged.clone()), unchanged);
    }

    fn test_config() -> Result<(tempfile::TempDir, Utf8PathBuf, Config)> {
        let td = tempfile::tempdir()?;
        let base = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let config_path = base.join("config.yaml");
        std::fs::write(
            &config_path,
            format!(
                "registry: {base}/users.txt\ncredential-store: {base}/users.pwd\ndata-root: {base}/data\n"
            ),
        )?;
        let config = Config::from_file(&config_path)?;
        Ok((td, config_path, config))
    }

    fn run(config_path: &Utf8Path, cmd: &[&str]) -> Result<(i32, String)> {
        let mut a = args(&["ftp-vusers", "--config", config_path.as_str()]);
        a.extend(args(cmd));
        let mut out = Vec::new();
        let code = run_with_output(a, &mut out)?;
        Ok((code, String::from_utf8(out)?))
    }

    #[test]
    fn test_list_and_check() -> Result<()> {
        let (_td, config_path, config) = test_config()?;
        let (code, out) = run(&config_path, &["check"])?;
        assert_eq!(code, 1);
        assert!(out.ends_with("users.txt: not found\n"), "{out}");

        std::fs::write(
            &config.registry,
            "alice|Secret1|site_a\nbad user|pw|x\nbob|Secret2|site_b\n",
        )?;
        let (code, out) = run(&config_path, &["list"])?;
        assert_eq!(code, 0);
        assert_eq!(out, "alice\tsite_a\nbob\tsite_b\n");
        assert!(!out.contains("Secret"));

        let (_, out) = run(&config_path, &["list", "--json"])?;
        let v: serde_json::Value = serde_json::from_str(&out)?;
        assert_eq!(v[1]["username"], "bob");
        assert_eq!(v[1]["home-subfolder"], "site_b");
        assert_eq!(v[1]["line"], 3);

        let (code, out) = run(&config_path, &["check"])?;
        assert_eq!(code, 1);
        assert!(out.contains("users.txt:2: invalid username 'bad user'"), "{out}");
        assert!(out.contains("2 valid user(s), 1 problem(s)"));

        std::fs::write(&config.registry, "alice|Secret1|site_a\n")?;
        let (code, _) = run(&config_path, &["check"])?;
        assert_eq!(code, 0);
        Ok(())
    }

    #[test]
    fn test_add_user_output() -> Result<()> {
        let (_td, config_path, config) = test_config()?;
        let (code, out) = run(&config_path, &["add-user", "bob", "Secret2", "site_b"])?;
        assert_eq!(code, 0);
        assert_eq!(out, "Added user 'bob' with home 'site_b'\n");
        assert_eq!(
            std::fs::read_to_string(&config.registry)?,
            "bob|Secret2|site_b\n"
        );
        Ok(())
    }

    #[test]
    fn test_render_config() -> Result<()> {
        let (td, config_path, config) = test_config()?;
        let (_, out) = run(&config_path, &["render-config"])?;
        assert!(out.contains(&format!("local_root={}/$USER\n", config.data_root)));
        let dest = Utf8PathBuf::try_from(td.path().join("vsftpd.conf"))?;
        let (code, out) = run(&config_path, &["render-config", "--output", dest.as_str()])?;
        assert_eq!(code, 0);
        assert!(out.is_empty());
        assert!(std::fs::read_to_string(&dest)?.contains("guest_enable=YES"));
        Ok(())
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
        let e: anyhow::Error = AddUserError::DuplicateUsername {
            username: "alice".into(),
            registry: "/etc/vsftpd/virtual_users.txt".into(),
        }
        .into();
        assert_eq!(exit_code(&e.context("Adding user")), 4);
    }
}
