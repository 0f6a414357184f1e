//! Installer: places built binaries, creates the runtime config once, and
//! records install metadata.
//!
//! Everything created here goes into the caller's [`InstallManifest`] as soon
//! as it exists on disk, so a failure halfway through still leaves a manifest
//! that uninstall can act on.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::build::{BuildOutput, BuildSelection, Component};
use crate::config::DeployContext;
use crate::error::DeployError;
use crate::manifest::{write_atomic, InstallManifest};
use crate::provision::SourceState;
use crate::service::{write_config_if_absent, ServiceConfig};

const BINARY_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    pub component: Component,
    pub path: PathBuf,
    pub sha256: String,
}

/// Copy every built binary into `dest_dir` with mode 0755.
///
/// Each copy goes through a temp file and a rename so a running binary is
/// replaced, not rewritten in place. The first failure aborts with
/// [`DeployError::FatalInstall`]; binaries installed before it stay recorded.
pub fn install_binaries(
    output: &BuildOutput,
    dest_dir: &Path,
    manifest: &mut InstallManifest,
) -> Result<Vec<InstalledBinary>> {
    let mut installed = Vec::new();
    for (component, src) in &output.binaries {
        let dest = dest_dir.join(component.binary_name());
        copy_into_place(src, &dest).map_err(|source| DeployError::FatalInstall {
            path: dest.clone(),
            source,
        })?;
        manifest.record(&dest)?;

        let sha256 = sha256_file(&dest)?;
        tracing::info!(%component, path = %dest.display(), "installed binary");
        installed.push(InstalledBinary {
            component: *component,
            path: dest,
            sha256,
        });
    }
    Ok(installed)
}

fn copy_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;

    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("binary");
    let tmp = parent.join(format!(".{name}.tmp-{}", std::process::id()));
    let result = fs::copy(src, &tmp)
        .and_then(|_| fs::set_permissions(&tmp, fs::Permissions::from_mode(BINARY_MODE)))
        .and_then(|()| fs::rename(&tmp, dest));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Create the runtime config from the configured defaults unless one exists.
///
/// Returns `true` if this call created it; only then is it recorded, since an
/// existing file belongs to the operator.
pub fn install_service_config(
    ctx: &DeployContext<'_>,
    manifest: &mut InstallManifest,
) -> Result<bool> {
    let path = ctx.paths().service_config_path(ctx.service_name());
    let defaults = ServiceConfig::from_defaults(&ctx.config.service)?;
    let created = write_config_if_absent(&path, &defaults)
        .with_context(|| format!("writing service config '{}'", path.display()))?;
    if created {
        manifest.record(&path)?;
        tracing::info!(path = %path.display(), "service config created");
    } else {
        tracing::info!(path = %path.display(), "keeping existing service config");
    }
    Ok(created)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryDigest {
    pub path: PathBuf,
    pub sha256: String,
}

/// What was installed and from where, persisted as `install.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMetadata {
    pub selection: String,
    pub repo_url: String,
    pub git_ref: String,
    pub commit: String,
    /// RFC 3339.
    pub installed_at: String,
    pub binaries: BTreeMap<String, BinaryDigest>,
}

impl InstallMetadata {
    pub fn new(
        selection: &BuildSelection,
        repo_url: &str,
        source: &SourceState,
        binaries: &[InstalledBinary],
    ) -> Result<Self> {
        let installed_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("formatting install time")?;
        Ok(Self {
            selection: selection.to_string(),
            repo_url: repo_url.to_string(),
            git_ref: source.git_ref.clone(),
            commit: source.commit.clone(),
            installed_at,
            binaries: binaries
                .iter()
                .map(|b| {
                    (
                        b.component.name().to_string(),
                        BinaryDigest {
                            path: b.path.clone(),
                            sha256: b.sha256.clone(),
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading '{}'", path.display()))
            }
        };
        let meta = serde_json::from_str(&raw)
            .with_context(|| format!("parsing install metadata '{}'", path.display()))?;
        Ok(Some(meta))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
            .with_context(|| format!("writing install metadata '{}'", path.display()))
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
