//! Wrappers and utilities on top of the `fail` crate.
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Return an error from the enclosing function when the failpoint `$name`
/// is configured, e.g. via `FAILPOINTS=credentials::install=return`.
#[macro_export]
macro_rules! try_fail_point {
    ($name:expr) => {{
        if let Some(e) = fail::eval($name, |msg| {
            let msg = msg.unwrap_or_else(|| format!("failpoint {}", $name));
            anyhow::Error::msg(msg)
        }) {
            return Err(From::from(e));
        }
    }};
}
