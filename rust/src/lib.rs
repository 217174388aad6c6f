//! Provisioning of virtual FTP users: a registry file is turned into a
//! hashed credential store and a chrooted per-user directory tree.
// SPDX-License-Identifier: Apache-2.0 OR MIT

// Lints
#![deny(unused_must_use)]
#![forbid(unsafe_code)]

// pub(crate) utilities
mod capstdext;
mod failpoints;

pub mod adduser;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod layout;
pub mod provision;
pub mod registry;
pub mod reload;
pub mod vsftpd;
