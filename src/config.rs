//! Manager configuration (`relayctl.toml`).
//!
//! Loaded once per invocation and passed down explicitly. Every section is
//! optional; missing keys take the defaults below.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::DeployError;
use crate::process::Runner;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/relayctl/relayctl.toml";
pub const CONFIG_PATH_ENV: &str = "RELAYCTL_CONFIG";

const MANIFEST_FILENAME: &str = "manifest.json";
const METADATA_FILENAME: &str = "install.json";
const LOCK_FILENAME: &str = "relayctl.lock";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub paths: PathsConfig,
    pub source: SourceConfig,
    pub build: BuildConfig,
    pub service: ServiceDefaults,
    pub panel: PanelConfig,
    pub acme: AcmeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Binaries are installed under `<prefix>/bin`.
    pub prefix: PathBuf,
    /// Manifest, install metadata and the invocation lock.
    pub state_dir: PathBuf,
    pub source_dir: PathBuf,
    /// Scratch build tree, never recorded in the manifest.
    pub build_dir: PathBuf,
    pub unit_dir: PathBuf,
    /// Runtime environment files live here, apart from the unit.
    pub config_dir: PathBuf,
    pub global_command: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/usr/local"),
            state_dir: PathBuf::from("/var/lib/relayctl"),
            source_dir: PathBuf::from("/usr/local/src/badvpn"),
            build_dir: PathBuf::from("/var/tmp/relayctl-build"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            config_dir: PathBuf::from("/etc/relayctl"),
            global_command: PathBuf::from("/usr/local/bin/relayctl"),
        }
    }
}

impl PathsConfig {
    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join(MANIFEST_FILENAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.join(METADATA_FILENAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILENAME)
    }

    pub fn unit_path(&self, service: &str) -> PathBuf {
        self.unit_dir.join(format!("{service}.service"))
    }

    pub fn service_config_path(&self, service: &str) -> PathBuf {
        self.config_dir.join(format!("{service}.env"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub repo_url: String,
    pub preferred_ref: String,
    /// Tried when `preferred_ref` does not exist upstream (renamed default branch).
    pub fallback_ref: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/ambrop72/badvpn.git".to_string(),
            preferred_ref: "master".to_string(),
            fallback_ref: Some("main".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// `full`, `udpgw-only`, `tun2socks-only` or `custom:BUILD_X,BUILD_Y`.
    pub selection: String,
    /// Parallel compile jobs; 0 uses the available parallelism.
    pub jobs: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            selection: "full".to_string(),
            jobs: 0,
        }
    }
}

/// Values written into the runtime config the first time it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceDefaults {
    pub name: String,
    pub listen_addr: String,
    pub max_clients: u32,
    pub max_connections_per_client: u32,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            name: "udpgw".to_string(),
            listen_addr: "127.0.0.1:7300".to_string(),
            max_clients: 1000,
            max_connections_per_client: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PanelConfig {
    pub binary: PathBuf,
    pub service: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/x-ui/x-ui"),
            service: "x-ui".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcmeConfig {
    pub client: PathBuf,
    pub install_url: String,
    pub email: Option<String>,
    pub ca: String,
    /// Certificates are materialized under `<cert_root>/<domain>/`.
    pub cert_root: PathBuf,
    pub challenge_port: u16,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            client: PathBuf::from("/root/.acme.sh/acme.sh"),
            install_url: "https://get.acme.sh".to_string(),
            email: None,
            ca: "letsencrypt".to_string(),
            cert_root: PathBuf::from("/root/cert"),
            challenge_port: 80,
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .with_context(|| format!("parsing config '{}'", origin.display()))?;
        config
            .validate()
            .with_context(|| format!("validating config '{}'", origin.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, `$RELAYCTL_CONFIG`, or the default path.
    ///
    /// Explicit and environment-provided paths must exist; the default path
    /// falls back to built-in defaults when absent.
    pub fn load(explicit: Option<&Path>, from_env: Option<PathBuf>) -> Result<Self> {
        let (path, required) = match (explicit, from_env) {
            (Some(path), _) => (path.to_path_buf(), true),
            (None, Some(path)) => (path, true),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !path.is_file() {
            if required {
                bail!("config file '{}' does not exist", path.display());
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml_str(&raw, &path)
    }

    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("paths.prefix", &self.paths.prefix),
            ("paths.state_dir", &self.paths.state_dir),
            ("paths.source_dir", &self.paths.source_dir),
            ("paths.build_dir", &self.paths.build_dir),
            ("paths.unit_dir", &self.paths.unit_dir),
            ("paths.config_dir", &self.paths.config_dir),
            ("paths.global_command", &self.paths.global_command),
            ("panel.binary", &self.panel.binary),
            ("acme.client", &self.acme.client),
            ("acme.cert_root", &self.acme.cert_root),
        ];
        for (field, path) in paths {
            if !path.is_absolute() {
                return Err(DeployError::invalid(
                    field,
                    format!("'{}' must be an absolute path", path.display()),
                )
                .into());
            }
        }

        validate_unit_name("service.name", &self.service.name)?;
        validate_unit_name("panel.service", &self.panel.service)?;

        if self.source.repo_url.trim().is_empty() {
            return Err(DeployError::invalid("source.repo_url", "must not be empty").into());
        }
        if self.source.preferred_ref.trim().is_empty() {
            return Err(DeployError::invalid("source.preferred_ref", "must not be empty").into());
        }

        crate::build::BuildSelection::parse(&self.build.selection)?;
        crate::service::ServiceConfig::from_defaults(&self.service)?;
        Ok(())
    }
}

fn validate_unit_name(field: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !valid {
        return Err(DeployError::invalid(field, format!("'{name}' is not a valid unit name")).into());
    }
    Ok(())
}

/// Per-invocation state shared by every component.
pub struct DeployContext<'a> {
    pub config: &'a ManagerConfig,
    pub runner: &'a dyn Runner,
    /// Effective uid captured once at startup.
    pub euid: u32,
}

impl<'a> DeployContext<'a> {
    pub fn new(config: &'a ManagerConfig, runner: &'a dyn Runner) -> Self {
        Self {
            config,
            runner,
            euid: crate::preflight::effective_uid(),
        }
    }

    pub fn with_euid(config: &'a ManagerConfig, runner: &'a dyn Runner, euid: u32) -> Self {
        Self {
            config,
            runner,
            euid,
        }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.config.paths
    }

    pub fn service_name(&self) -> &str {
        &self.config.service.name
    }
}
