// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Failpoints are process global, so this lives in its own test binary.

use anyhow::Result;
use camino::Utf8PathBuf;
use ftp_vusers::config::ServiceIdentity;
use ftp_vusers::credentials::CredentialStore;

#[test]
fn interrupted_install_keeps_previous_store() -> Result<()> {
    let scenario = fail::FailScenario::setup();
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::try_from(td.path().join("virtual_users.pwd"))?;
    let identity = ServiceIdentity::current();

    let mut first = CredentialStore::new();
    first.push("alice", "$6$salt$first");
    first.install(&path, identity)?;
    let before = std::fs::read(&path)?;

    let mut second = CredentialStore::new();
    second.push("alice", "$6$salt$second");
    second.push("bob", "$6$salt$other");
    fail::cfg("credentials::install", "return(injected)").map_err(anyhow::Error::msg)?;
    let err = second.install(&path, identity).unwrap_err();
    assert!(format!("{err:#}").contains("injected"), "{err:#}");
    assert_eq!(std::fs::read(&path)?, before);
    let leftovers: Vec<_> = std::fs::read_dir(td.path())?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(leftovers.len(), 1, "{leftovers:?}");

    fail::remove("credentials::install");
    second.install(&path, identity)?;
    assert_eq!(CredentialStore::load(&path)?, Some(second));
    scenario.teardown();
    Ok(())
}
