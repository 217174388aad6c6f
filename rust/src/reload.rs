//! Telling the running daemon to pick up a changed registry.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Command;
use std::str::FromStr;

use crate::config::ReloadMethod;

/// Something that makes the service re-run provisioning.
pub trait Reloader: std::fmt::Debug {
    /// Human readable description for logs.
    fn describe(&self) -> String;
    fn reload(&self) -> Result<()>;
}

/// Leaves the restart to the operator.
#[derive(Debug, Default)]
pub struct ManualReload;

impl Reloader for ManualReload {
    fn describe(&self) -> String {
        "manual restart".to_string()
    }

    fn reload(&self) -> Result<()> {
        tracing::warn!("no reload method configured; restart the FTP service to apply changes");
        Ok(())
    }
}

/// Runs a fixed command.
#[derive(Debug)]
pub struct CommandReload {
    argv: Vec<String>,
}

impl CommandReload {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            bail!("reload command must not be empty");
        }
        Ok(Self { argv })
    }
}

impl Reloader for CommandReload {
    fn describe(&self) -> String {
        format!("command {:?}", self.argv)
    }

    #[context("Running reload command {:?}", self.argv)]
    fn reload(&self) -> Result<()> {
        let (cmd, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("empty reload command"))?;
        let status = Command::new(cmd).args(args).status()?;
        if !status.success() {
            bail!("reload command failed: {status}");
        }
        Ok(())
    }
}

/// Signals the daemon process recorded in a pidfile.
#[derive(Debug)]
pub struct SignalReload {
    pidfile: Utf8PathBuf,
    signal: Signal,
}

impl SignalReload {
    pub fn new(pidfile: Utf8PathBuf, signal: &str) -> Result<Self> {
        let signal =
            Signal::from_str(signal).with_context(|| format!("Invalid signal '{signal}'"))?;
        Ok(Self { pidfile, signal })
    }
}

impl Reloader for SignalReload {
    fn describe(&self) -> String {
        format!("{} to pid in {}", self.signal, self.pidfile)
    }

    #[context("Sending {} to pid from {}", self.signal, self.pidfile)]
    fn reload(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.pidfile)?;
        let pid: i32 = content
            .trim()
            .parse()
            .with_context(|| format!("Invalid pid '{}'", content.trim()))?;
        if pid <= 0 {
            bail!("Invalid pid {pid}");
        }
        kill(Pid::from_raw(pid), self.signal)?;
        Ok(())
    }
}

/// Build the reloader selected in the configuration.
pub fn from_config(method: &ReloadMethod) -> Result<Box<dyn Reloader>> {
    let r: Box<dyn Reloader> = match method {
        ReloadMethod::None => Box::new(ManualReload),
        ReloadMethod::Command { argv } => Box::new(CommandReload::new(argv.clone())?),
        ReloadMethod::Signal { pidfile, signal } => {
            Box::new(SignalReload::new(pidfile.clone(), signal)?)
        }
    };
    Ok(r)
}
