//! Build tool provisioning through the host package manager.

use anyhow::{Context, Result};

use crate::config::DeployContext;
use crate::error::DeployError;
use crate::preflight::{missing_tools, require_privilege};
use crate::process::Cmd;

/// Tools the badvpn build needs.
///
/// Each tuple is (command_name, logical_package); the logical package is
/// mapped to distribution package names by [`PackageManager::packages_for`].
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("git", "git"),
    ("cmake", "cmake"),
    ("make", "make"),
    ("cc", "compiler"),
    ("c++", "compiler"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
}

impl PackageManager {
    const PROBE_ORDER: [PackageManager; 4] = [Self::Apt, Self::Dnf, Self::Yum, Self::Apk];

    pub fn program(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Apk => "apk",
        }
    }

    /// First package manager found on PATH.
    pub fn detect(ctx: &DeployContext<'_>) -> Option<Self> {
        Self::PROBE_ORDER
            .into_iter()
            .find(|pm| ctx.runner.locate(pm.program()).is_some())
    }

    pub fn packages_for(self, logical: &str) -> Vec<&'static str> {
        match (self, logical) {
            (Self::Apt, "compiler") => vec!["build-essential"],
            (Self::Dnf | Self::Yum, "compiler") => vec!["gcc", "gcc-c++"],
            (Self::Apk, "compiler") => vec!["build-base"],
            (_, "git") => vec!["git"],
            (_, "cmake") => vec!["cmake"],
            (_, "make") => vec!["make"],
            (_, "curl") => vec!["curl"],
            (_, "socat") => vec!["socat"],
            _ => Vec::new(),
        }
    }

    fn install_commands(self, packages: &[&str]) -> Vec<Cmd> {
        match self {
            Self::Apt => vec![
                Cmd::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive"),
                Cmd::new("apt-get")
                    .args(["install", "-y", "--no-install-recommends"])
                    .args(packages)
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            ],
            Self::Dnf | Self::Yum => {
                vec![Cmd::new(self.program()).args(["install", "-y"]).args(packages)]
            }
            Self::Apk => vec![Cmd::new("apk").args(["add", "--no-cache"]).args(packages)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolsOutcome {
    AlreadySatisfied,
    Installed(Vec<String>),
}

/// Install whatever `tools` are missing; a no-op when all are present.
pub fn ensure_tools(ctx: &DeployContext<'_>, tools: &[(&str, &str)]) -> Result<ToolsOutcome> {
    let missing = missing_tools(ctx.runner, tools);
    if missing.is_empty() {
        return Ok(ToolsOutcome::AlreadySatisfied);
    }

    require_privilege(ctx)?;

    let names = missing.iter().map(|(tool, _)| *tool).collect::<Vec<_>>();
    let manager = PackageManager::detect(ctx).ok_or_else(|| DeployError::DependencyUnavailable {
        name: names.join(", "),
        reason: "no supported package manager (apt-get, dnf, yum, apk) found".to_string(),
    })?;

    let mut packages: Vec<&str> = Vec::new();
    for (tool, logical) in &missing {
        let mapped = manager.packages_for(logical);
        if mapped.is_empty() {
            return Err(DeployError::DependencyUnavailable {
                name: tool.to_string(),
                reason: format!("no {} package known for '{}'", manager.program(), logical),
            }
            .into());
        }
        for package in mapped {
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
    }

    tracing::info!(
        manager = manager.program(),
        packages = %packages.join(" "),
        "installing missing build tools"
    );
    for cmd in manager.install_commands(&packages) {
        cmd.run(ctx.runner)
            .with_context(|| format!("installing packages: {}", packages.join(" ")))?;
    }

    let still_missing = missing_tools(ctx.runner, tools);
    if !still_missing.is_empty() {
        let names = still_missing
            .iter()
            .map(|(tool, _)| *tool)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DeployError::DependencyUnavailable {
            name: names,
            reason: "still missing after package installation".to_string(),
        }
        .into());
    }

    Ok(ToolsOutcome::Installed(
        packages.into_iter().map(str::to_string).collect(),
    ))
}
