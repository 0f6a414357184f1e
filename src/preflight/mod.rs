//! Preflight checks run before any mutating step.
//!
//! Validates privilege, tool availability and exclusive access to the state
//! directory so failures surface before anything on disk has changed.
//!
//! # Example
//!
//! ```rust,ignore
//! use relayctl::preflight::{require_privilege, InvocationLock};
//!
//! require_privilege(&ctx)?;
//! let _lock = InvocationLock::acquire(&ctx.paths().lock_path())?;
//! ```

use std::fs::{self, File, OpenOptions};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::config::DeployContext;
use crate::error::DeployError;
use crate::process::Runner;

/// Effective uid of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Fail with [`DeployError::PrivilegeRequired`] unless running as root.
pub fn require_privilege(ctx: &DeployContext<'_>) -> Result<()> {
    if ctx.euid != 0 {
        return Err(DeployError::PrivilegeRequired { euid: ctx.euid }.into());
    }
    Ok(())
}

/// Check if a command exists on the host system.
pub fn command_exists(runner: &dyn Runner, cmd: &str) -> bool {
    runner.locate(cmd).is_some()
}

/// Return the (command, package) pairs whose command is not on PATH.
pub fn missing_tools<'t>(
    runner: &dyn Runner,
    tools: &[(&'t str, &'t str)],
) -> Vec<(&'t str, &'t str)> {
    tools
        .iter()
        .copied()
        .filter(|(tool, _)| !command_exists(runner, tool))
        .collect()
}

/// Whether a TCP port on all interfaces is already bound by someone else,
/// over either IPv4 or IPv6.
pub fn port_in_use(port: u16) -> bool {
    [IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)]
        .into_iter()
        .any(|ip| bind_refused(ip, port))
}

// A host without IPv6 fails the bind with something other than AddrInUse.
fn bind_refused(ip: IpAddr, port: u16) -> bool {
    match TcpListener::bind((ip, port)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) => err.kind() == std::io::ErrorKind::AddrInUse,
    }
}

/// Exclusive advisory lock on the state directory.
///
/// Concurrent invocations are a usage error: the second one fails immediately
/// instead of waiting. The lock is released on drop.
#[derive(Debug)]
pub struct InvocationLock {
    _file: File,
    path: PathBuf,
}

impl InvocationLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory '{}'", parent.display()))?;
        }

        // Never unlink the lock file; a fresh inode would let a second
        // process lock it while the first still holds the old one.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(DeployError::ConcurrentInvocation {
                path: path.to_path_buf(),
            }
            .into());
        }

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Privilege check followed by the invocation lock, in that order.
///
/// Every mutating operation starts here so an unprivileged or concurrent run
/// is refused before anything changes.
pub fn begin_mutation(ctx: &DeployContext<'_>) -> Result<InvocationLock> {
    require_privilege(ctx)?;
    InvocationLock::acquire(&ctx.paths().lock_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::classify;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    #[test]
    fn test_require_privilege() {
        let config = ManagerConfig::default();
        let runner = ScriptedRunner::new();

        let root = DeployContext::with_euid(&config, &runner, 0);
        assert!(require_privilege(&root).is_ok());

        let user = DeployContext::with_euid(&config, &runner, 1000);
        let err = require_privilege(&user).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::PrivilegeRequired { euid: 1000 })
        ));
    }

    #[test]
    fn test_missing_tools() {
        let runner = ScriptedRunner::new().with_programs(&["git", "cmake"]);
        let tools = &[("git", "git"), ("cmake", "cmake"), ("gcc", "build-essential")];

        assert_eq!(missing_tools(&runner, tools), vec![("gcc", "build-essential")]);
    }

    #[test]
    fn test_port_in_use_detects_bound_listener() {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(port_in_use(port));
        drop(listener);
    }

    #[test]
    fn test_port_in_use_detects_ipv6_listener() {
        let Ok(listener) = TcpListener::bind((Ipv6Addr::LOCALHOST, 0)) else {
            return; // no IPv6 on this host
        };
        let port = listener.local_addr().unwrap().port();

        assert!(port_in_use(port));
        drop(listener);
    }

    #[test]
    fn test_second_lock_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state/relayctl.lock");

        let first = InvocationLock::acquire(&path).unwrap();
        let err = InvocationLock::acquire(&path).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::ConcurrentInvocation { .. })
        ));

        drop(first);
        assert!(InvocationLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_begin_mutation_checks_privilege_before_locking() {
        let temp = TempDir::new().unwrap();
        let mut config = ManagerConfig::default();
        config.paths.state_dir = temp.path().join("state");
        let runner = ScriptedRunner::new();

        let user = DeployContext::with_euid(&config, &runner, 1000);
        assert!(begin_mutation(&user).is_err());
        assert!(!config.paths.lock_path().exists());

        let root = DeployContext::with_euid(&config, &runner, 0);
        let lock = begin_mutation(&root).unwrap();
        assert_eq!(lock.path(), config.paths.lock_path());
    }
}
