//! Error taxonomy and best-effort warnings.
//!
//! Fatal failures are raised as [`DeployError`] wrapped in `anyhow::Error`, so
//! call sites keep adding `.with_context(..)` the usual way while the binary
//! can still recover the category by downcasting.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Categorized fatal failures.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("this operation requires root privileges (effective uid {euid})")]
    PrivilegeRequired { euid: u32 },

    #[error("'{}' exists and is not recognized as ours: {reason}", .path.display())]
    Conflict { path: PathBuf, reason: String },

    #[error("build descriptor '{}' not found after source sync", .path.display())]
    MissingBuildDescriptor { path: PathBuf },

    #[error("build finished but expected binaries are missing: {}", display_paths(.missing))]
    BuildIncomplete { missing: Vec<PathBuf> },

    #[error("failed to install '{}': {source}", .path.display())]
    FatalInstall {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no install manifest at '{}'; refusing to guess which files to remove", .path.display())]
    ManifestMissing { path: PathBuf },

    #[error("port {port} is already bound by another process")]
    PortBlocked { port: u16 },

    #[error("a certificate for '{domain}' is already issued (use --force to re-issue)")]
    AlreadyIssued { domain: String },

    #[error("issuance for '{domain}' failed: domain does not resolve to this host ({detail})")]
    DnsNotPointed { domain: String, detail: String },

    #[error("issuance for '{domain}' failed: {detail}")]
    Issuance { domain: String, detail: String },

    #[error("required dependency '{name}' is unavailable: {reason}")]
    DependencyUnavailable { name: String, reason: String },

    #[error("invalid {what}: {reason}")]
    InvalidInput { what: String, reason: String },

    #[error("source sync failed: {0}")]
    SourceSync(String),

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("another relayctl invocation holds '{}'", .path.display())]
    ConcurrentInvocation { path: PathBuf },
}

impl DeployError {
    /// Short category label printed with fatal errors.
    pub fn category(&self) -> &'static str {
        match self {
            Self::PrivilegeRequired { .. } => "privilege-required",
            Self::Conflict { .. } => "conflict",
            Self::MissingBuildDescriptor { .. } => "missing-build-descriptor",
            Self::BuildIncomplete { .. } => "build-incomplete",
            Self::FatalInstall { .. } => "fatal-install",
            Self::ManifestMissing { .. } => "manifest-missing",
            Self::PortBlocked { .. } => "port-blocked",
            Self::AlreadyIssued { .. } => "already-issued",
            Self::DnsNotPointed { .. } => "dns-not-pointed",
            Self::Issuance { .. } => "issuance",
            Self::DependencyUnavailable { .. } => "dependency-unavailable",
            Self::InvalidInput { .. } => "invalid-input",
            Self::SourceSync(_) => "source-sync",
            Self::CommandFailed { .. } => "command-failed",
            Self::ConcurrentInvocation { .. } => "concurrent-invocation",
        }
    }

    /// Process exit code for this category. Never zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::PrivilegeRequired { .. } => 10,
            Self::Conflict { .. } => 11,
            Self::MissingBuildDescriptor { .. } => 12,
            Self::BuildIncomplete { .. } => 13,
            Self::FatalInstall { .. } => 14,
            Self::ManifestMissing { .. } => 15,
            Self::PortBlocked { .. } => 16,
            Self::AlreadyIssued { .. } => 17,
            Self::DnsNotPointed { .. } => 18,
            Self::Issuance { .. } => 19,
            Self::DependencyUnavailable { .. } => 20,
            Self::InvalidInput { .. } => 2,
            Self::SourceSync(_) => 21,
            Self::CommandFailed { .. } => 22,
            Self::ConcurrentInvocation { .. } => 23,
        }
    }

    pub(crate) fn invalid(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// Find the categorized error inside an `anyhow` chain, if there is one.
pub fn classify(err: &anyhow::Error) -> Option<&DeployError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DeployError>())
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A best-effort step that failed without aborting the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub step: String,
    pub message: String,
}

impl Warning {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Turn a failed best-effort step into a logged [`Warning`].
pub(crate) fn best_effort<T>(step: &str, result: anyhow::Result<T>) -> Option<Warning> {
    match result {
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(step, "{:#}", err);
            Some(Warning::new(step, format!("{:#}", err)))
        }
    }
}
