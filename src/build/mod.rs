//! Build orchestration for the badvpn relays.
//!
//! The external build is configured with `BUILD_NOTHING_BY_DEFAULT` and one
//! `BUILD_*` flag per selected component. Once it returns, every binary the
//! selection implies must exist and be executable; a partial set is fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::DeployContext;
use crate::error::DeployError;
use crate::process::Cmd;

/// A daemon the build can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Udpgw,
    Tun2socks,
}

impl Component {
    pub const ALL: [Component; 2] = [Self::Udpgw, Self::Tun2socks];

    pub fn name(self) -> &'static str {
        match self {
            Self::Udpgw => "udpgw",
            Self::Tun2socks => "tun2socks",
        }
    }

    /// Build-system feature flag enabling this component.
    pub fn flag(self) -> &'static str {
        match self {
            Self::Udpgw => "BUILD_UDPGW",
            Self::Tun2socks => "BUILD_TUN2SOCKS",
        }
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Udpgw => "badvpn-udpgw",
            Self::Tun2socks => "badvpn-tun2socks",
        }
    }

    /// Where the build system leaves the binary, relative to the build dir.
    pub fn output_path(self) -> PathBuf {
        PathBuf::from(self.name()).join(self.binary_name())
    }

    fn from_flag(flag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.flag() == flag)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which components a run builds. Fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSelection {
    Full,
    Tun2socksOnly,
    UdpgwOnly,
    /// Raw `BUILD_*` flags, passed through verbatim.
    Custom(BTreeSet<String>),
}

impl BuildSelection {
    /// Parse `full`, `udpgw-only`, `tun2socks-only` or `custom:FLAG,FLAG`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "full" | "all" => return Ok(Self::Full),
            "udpgw-only" | "udpgw" => return Ok(Self::UdpgwOnly),
            "tun2socks-only" | "tun2socks" => return Ok(Self::Tun2socksOnly),
            _ => {}
        }

        let Some(list) = raw
            .strip_prefix("custom:")
            .or_else(|| raw.strip_prefix("CUSTOM:"))
        else {
            return Err(DeployError::invalid(
                "build selection",
                format!(
                    "'{raw}' (expected full, udpgw-only, tun2socks-only or custom:BUILD_X,...)"
                ),
            )
            .into());
        };

        let mut flags = BTreeSet::new();
        for flag in list.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let flag = flag.to_ascii_uppercase();
            let well_formed = flag.starts_with("BUILD_")
                && flag.len() > "BUILD_".len()
                && flag
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if !well_formed {
                return Err(DeployError::invalid(
                    "build flag",
                    format!("'{flag}' is not of the form BUILD_<NAME>"),
                )
                .into());
            }
            flags.insert(flag);
        }

        if !flags.iter().any(|f| Component::from_flag(f).is_some()) {
            return Err(DeployError::invalid(
                "build selection",
                "custom flag set must enable BUILD_UDPGW or BUILD_TUN2SOCKS",
            )
            .into());
        }
        Ok(Self::Custom(flags))
    }

    pub fn components(&self) -> BTreeSet<Component> {
        match self {
            Self::Full => Component::ALL.into_iter().collect(),
            Self::UdpgwOnly => BTreeSet::from([Component::Udpgw]),
            Self::Tun2socksOnly => BTreeSet::from([Component::Tun2socks]),
            Self::Custom(flags) => flags.iter().filter_map(|f| Component::from_flag(f)).collect(),
        }
    }

    pub fn includes(&self, component: Component) -> bool {
        self.components().contains(&component)
    }

    /// `-D` definitions for the configure step.
    ///
    /// Known components that are not selected are switched off explicitly so
    /// a reused build cache cannot leave them enabled.
    pub fn cmake_defines(&self) -> Vec<String> {
        let mut defines = vec![
            "-DCMAKE_BUILD_TYPE=Release".to_string(),
            "-DBUILD_NOTHING_BY_DEFAULT=1".to_string(),
        ];
        let selected = self.components();
        for component in Component::ALL {
            let value = u8::from(selected.contains(&component));
            defines.push(format!("-D{}={}", component.flag(), value));
        }
        if let Self::Custom(flags) = self {
            defines.extend(
                flags
                    .iter()
                    .filter(|f| Component::from_flag(f).is_none())
                    .map(|f| format!("-D{f}=1")),
            );
        }
        defines
    }
}

impl fmt::Display for BuildSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::UdpgwOnly => f.write_str("udpgw-only"),
            Self::Tun2socksOnly => f.write_str("tun2socks-only"),
            Self::Custom(flags) => {
                write!(f, "custom:{}", flags.iter().cloned().collect::<Vec<_>>().join(","))
            }
        }
    }
}

/// Validated build products, keyed by component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub binaries: BTreeMap<Component, PathBuf>,
}

/// Configure and compile, then verify the selection's binaries exist.
pub fn build(
    ctx: &DeployContext<'_>,
    source_dir: &Path,
    build_dir: &Path,
    selection: &BuildSelection,
) -> Result<BuildOutput> {
    fs::create_dir_all(build_dir)
        .with_context(|| format!("creating build directory '{}'", build_dir.display()))?;

    tracing::info!(%selection, dir = %build_dir.display(), "configuring build");
    Cmd::new("cmake")
        .arg("-S")
        .arg_path(source_dir)
        .arg("-B")
        .arg_path(build_dir)
        .args(selection.cmake_defines())
        .run(ctx.runner)
        .with_context(|| format!("configuring build of '{}'", source_dir.display()))?;

    let jobs = build_jobs(ctx.config.build.jobs);
    tracing::info!(jobs, "compiling");
    Cmd::new("cmake")
        .arg("--build")
        .arg_path(build_dir)
        .arg("-j")
        .arg(jobs.to_string())
        .run(ctx.runner)
        .with_context(|| format!("compiling in '{}'", build_dir.display()))?;

    verify_outputs(build_dir, selection)
}

/// Map each selected component to its binary, or fail with everything missing.
pub fn verify_outputs(build_dir: &Path, selection: &BuildSelection) -> Result<BuildOutput> {
    let mut binaries = BTreeMap::new();
    let mut missing = Vec::new();
    for component in selection.components() {
        let path = build_dir.join(component.output_path());
        if is_executable_file(&path) {
            binaries.insert(component, path);
        } else {
            missing.push(path);
        }
    }
    if !missing.is_empty() {
        return Err(DeployError::BuildIncomplete { missing }.into());
    }
    Ok(BuildOutput { binaries })
}

fn build_jobs(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub(crate) fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
