//! Deployment lifecycle manager for the badvpn relay daemons.
//!
//! `relayctl` builds `badvpn-udpgw` and `badvpn-tun2socks` from source,
//! installs them, runs the UDP gateway under systemd, and can later remove
//! exactly what it installed. It also issues a TLS certificate for an
//! adjacent web panel.
//!
//! - **Manifest** - Append-only record of every installed path; the only input to uninstall
//! - **Provisioning** - Build tools through the package manager, source through git
//! - **Build** - cmake configure/compile for a component selection, output verification
//! - **Install** - Binary placement, create-once runtime config, install metadata
//! - **Service** - Runtime env file and the systemd unit that reads it
//! - **Control** - Status, logs, start/stop/restart, config edits
//! - **Cert** - acme.sh issuance handed to the panel
//!
//! # Architecture
//!
//! ```text
//! relayctl (bin)
//!     │
//!     ├── config::ManagerConfig   loaded once, passed down in DeployContext
//!     ├── lifecycle::install      provision → build → install → unit
//!     ├── lifecycle::uninstall    manifest → remove_all
//!     ├── control::ControlSurface systemctl / journalctl / ss
//!     └── cert::issue_certificate acme.sh → panel
//! ```
//!
//! Every external program runs through [`process::Runner`], so the whole
//! workflow can be driven by a scripted runner in tests.

pub mod build;
pub mod cert;
pub mod config;
pub mod control;
pub mod error;
pub mod install;
pub mod lifecycle;
pub mod manifest;
pub mod preflight;
pub mod process;
pub mod provision;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::{DeployContext, ManagerConfig};
pub use error::{classify, DeployError, Warning};
pub use process::{Runner, SystemRunner};
