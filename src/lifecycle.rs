//! Install, uninstall and global-command workflows.
//!
//! `install` drives provisioning, build and placement end to end and always
//! persists the manifest it has built up, even when placement fails midway.
//! `uninstall` removes exactly what that manifest lists.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::build::{self, BuildSelection, Component};
use crate::config::DeployContext;
use crate::control::Supervisor;
use crate::error::{best_effort, DeployError, Warning};
use crate::install::{
    install_binaries, install_service_config, InstallMetadata, InstalledBinary,
};
use crate::manifest::{InstallManifest, ManifestStore, RemovalReport};
use crate::preflight::begin_mutation;
use crate::provision::{ensure_tools, sync_source, SourceSpec, SourceState, REQUIRED_TOOLS};
use crate::service::unit;

#[derive(Debug)]
pub struct InstallReport {
    pub selection: BuildSelection,
    pub source: SourceState,
    pub binaries: Vec<InstalledBinary>,
    /// Set when this run created the runtime config.
    pub config_created: Option<PathBuf>,
    pub unit: Option<PathBuf>,
    pub warnings: Vec<Warning>,
}

/// Everything placed on disk during one install.
struct Placement {
    binaries: Vec<InstalledBinary>,
    config_created: Option<PathBuf>,
    unit: Option<PathBuf>,
    warnings: Vec<Warning>,
}

pub fn install(ctx: &DeployContext<'_>, selection: &BuildSelection) -> Result<InstallReport> {
    let _lock = begin_mutation(ctx)?;
    let paths = ctx.paths();

    ensure_tools(ctx, REQUIRED_TOOLS)?;
    let spec = SourceSpec::from_context(ctx);
    let source = sync_source(ctx, &spec)?;
    let output = build::build(ctx, &source.dir, &paths.build_dir, selection)?;

    let store = ManifestStore::new(paths.manifest_path());
    let mut manifest = store.load_or_new()?;
    let placed = place(ctx, &output, &mut manifest);
    let persisted = store.persist(&manifest);
    let mut placed = placed?;
    persisted?;

    if placed.unit.is_some() {
        let supervisor = Supervisor::new(ctx.runner);
        let service = ctx.service_name();
        placed
            .warnings
            .extend(best_effort("enable", supervisor.enable(service)));
        placed
            .warnings
            .extend(best_effort("restart", supervisor.restart(service)));
    }

    let metadata = InstallMetadata::new(selection, &spec.repo_url, &source, &placed.binaries)?;
    metadata.persist(&paths.metadata_path())?;

    tracing::info!(
        %selection,
        binaries = placed.binaries.len(),
        warnings = placed.warnings.len(),
        "install complete"
    );
    Ok(InstallReport {
        selection: selection.clone(),
        source,
        binaries: placed.binaries,
        config_created: placed.config_created,
        unit: placed.unit,
        warnings: placed.warnings,
    })
}

fn place(
    ctx: &DeployContext<'_>,
    output: &build::BuildOutput,
    manifest: &mut InstallManifest,
) -> Result<Placement> {
    let paths = ctx.paths();
    let binaries = install_binaries(output, &paths.bin_dir(), manifest)?;

    // Only the gateway runs as a service; tun2socks is started on demand.
    let Some(gateway) = binaries.iter().find(|b| b.component == Component::Udpgw) else {
        return Ok(Placement {
            binaries,
            config_created: None,
            unit: None,
            warnings: Vec::new(),
        });
    };

    let config_path = paths.service_config_path(ctx.service_name());
    let config_created = install_service_config(ctx, manifest)?.then(|| config_path.clone());

    let generated = unit::generate(ctx, &gateway.path, &config_path)?;
    manifest.record(&generated.path)?;

    Ok(Placement {
        binaries,
        config_created,
        unit: Some(generated.path),
        warnings: generated.warnings,
    })
}

#[derive(Debug)]
pub struct UninstallReport {
    pub removal: RemovalReport,
    pub warnings: Vec<Warning>,
}

/// Remove every artifact the manifest lists, then the manifest itself.
///
/// Refuses to run without a manifest.
pub fn uninstall(ctx: &DeployContext<'_>) -> Result<UninstallReport> {
    let _lock = begin_mutation(ctx)?;
    let paths = ctx.paths();
    let store = ManifestStore::new(paths.manifest_path());
    let manifest = store.load()?;

    let supervisor = Supervisor::new(ctx.runner);
    let service = ctx.service_name();
    let mut warnings = Vec::new();
    if manifest.contains(&paths.unit_path(service)) {
        warnings.extend(best_effort("stop", supervisor.stop(service)));
        warnings.extend(best_effort("disable", supervisor.disable(service)));
    }

    let removal = store.remove_all()?;
    warnings.extend(removal.warnings());
    warnings.extend(best_effort("daemon-reload", supervisor.daemon_reload()));

    let metadata = paths.metadata_path();
    match fs::remove_file(&metadata) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warnings.push(Warning::new(
            "uninstall",
            format!("could not remove '{}': {}", metadata.display(), err),
        )),
    }

    tracing::info!(
        removed = removal.removed.len(),
        warnings = warnings.len(),
        "uninstall complete"
    );
    Ok(UninstallReport { removal, warnings })
}

/// Link the configured global command path to `exe` and record the link.
pub fn install_global(ctx: &DeployContext<'_>, exe: &Path) -> Result<PathBuf> {
    let _lock = begin_mutation(ctx)?;
    let paths = ctx.paths();
    let link = paths.global_command.clone();
    let store = ManifestStore::new(paths.manifest_path());
    let mut manifest = store.load_or_new()?;

    match fs::symlink_metadata(&link) {
        Ok(_) if fs::read_link(&link).ok().as_deref() == Some(exe) => {}
        Ok(_) if manifest.contains(&link) => {
            fs::remove_file(&link)
                .with_context(|| format!("replacing '{}'", link.display()))?;
            create_link(exe, &link)?;
        }
        Ok(_) => {
            return Err(DeployError::Conflict {
                path: link,
                reason: "file exists and was not installed by relayctl".to_string(),
            }
            .into());
        }
        Err(err) if err.kind() == ErrorKind::NotFound => create_link(exe, &link)?,
        Err(err) => {
            return Err(err).with_context(|| format!("inspecting '{}'", link.display()));
        }
    }

    manifest.record(&link)?;
    store.persist(&manifest)?;
    tracing::info!(link = %link.display(), target = %exe.display(), "global command installed");
    Ok(link)
}

fn create_link(exe: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    symlink(exe, link).map_err(|source| {
        DeployError::FatalInstall {
            path: link.to_path_buf(),
            source,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::classify;
    use crate::process::{Cmd, CmdResult};
    use crate::provision::BUILD_DESCRIPTOR;
    use crate::service::ServiceConfig;
    use crate::testing::ScriptedRunner;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sandbox(root: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.paths.prefix = root.join("usr/local");
        config.paths.state_dir = root.join("var/lib/relayctl");
        config.paths.source_dir = root.join("src/badvpn");
        config.paths.build_dir = root.join("build");
        config.paths.unit_dir = root.join("etc/systemd/system");
        config.paths.config_dir = root.join("etc/relayctl");
        config.paths.global_command = root.join("usr/local/bin/relayctl");
        config
    }

    /// git, cmake and systemctl that behave like a healthy host.
    fn healthy_host() -> ScriptedRunner {
        ScriptedRunner::new()
            .with_programs(&["git", "cmake", "make", "cc", "c++"])
            .on("git", |cmd| {
                let args = cmd.arg_strings();
                match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["clone", _, dest] => {
                        let dest = Path::new(dest);
                        fs::create_dir_all(dest.join(".git")).unwrap();
                        fs::write(dest.join(BUILD_DESCRIPTOR), "project(badvpn)\n").unwrap();
                        CmdResult::ok("")
                    }
                    ["-C", _, "remote", "get-url", "origin"] => {
                        CmdResult::ok("https://github.com/ambrop72/badvpn.git\n")
                    }
                    ["-C", _, "rev-parse", "HEAD"] => CmdResult::ok("cafef00d\n"),
                    _ => CmdResult::ok(""),
                }
            })
            .on("cmake", |cmd| {
                let args = cmd.arg_strings();
                if args.first().map(String::as_str) == Some("--build") {
                    fake_compile(cmd);
                }
                CmdResult::ok("")
            })
    }

    fn fake_compile(cmd: &Cmd) {
        let args = cmd.arg_strings();
        let build_dir = Path::new(&args[1]);
        for component in Component::ALL {
            let out = build_dir.join(component.output_path());
            fs::create_dir_all(out.parent().unwrap()).unwrap();
            fs::write(&out, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&out, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn fresh_udpgw_install_records_binary_unit_and_config() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = healthy_host();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        let report = install(&ctx, &BuildSelection::UdpgwOnly).unwrap();
        assert!(report.warnings.is_empty());

        let paths = &config.paths;
        let binary = paths.bin_dir().join("badvpn-udpgw");
        let unit = paths.unit_path("udpgw");
        let env = paths.service_config_path("udpgw");
        let manifest = ManifestStore::new(paths.manifest_path()).load().unwrap();
        let recorded: BTreeSet<_> = manifest.entries().iter().cloned().collect();
        assert_eq!(recorded, BTreeSet::from([binary.clone(), unit, env.clone()]));

        assert!(!paths.bin_dir().join("badvpn-tun2socks").exists());
        assert_eq!(
            ServiceConfig::load(&env).unwrap().listen_addr,
            "127.0.0.1:7300"
        );
        assert!(runner.called("systemctl enable udpgw"));
        assert!(runner.called("systemctl restart udpgw"));

        let meta = InstallMetadata::load(&paths.metadata_path()).unwrap().unwrap();
        assert_eq!(meta.commit, "cafef00d");
        assert_eq!(meta.selection, "udpgw-only");
    }

    #[test]
    fn reinstall_keeps_operator_config() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = healthy_host();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        install(&ctx, &BuildSelection::Full).unwrap();
        let env = config.paths.service_config_path("udpgw");
        fs::write(
            &env,
            "LISTEN_ADDR=0.0.0.0:9000\nMAX_CLIENTS=5\nMAX_CONNECTIONS_FOR_CLIENT=2\n",
        )
        .unwrap();

        let second = install(&ctx, &BuildSelection::Full).unwrap();
        assert_eq!(second.config_created, None);
        assert_eq!(
            ServiceConfig::load(&env).unwrap().listen_addr,
            "0.0.0.0:9000"
        );
        let manifest = ManifestStore::new(config.paths.manifest_path())
            .load()
            .unwrap();
        // Config recorded by the first run is still accounted for.
        assert!(manifest.contains(&env));
        assert_eq!(manifest.len(), 4);
    }

    #[test]
    fn tun2socks_only_installs_no_unit() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = healthy_host();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        let report = install(&ctx, &BuildSelection::Tun2socksOnly).unwrap();
        assert_eq!(report.unit, None);
        assert!(!config.paths.unit_path("udpgw").exists());
        assert!(!runner.called("systemctl"));
    }

    #[test]
    fn unprivileged_install_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = healthy_host();
        let ctx = DeployContext::with_euid(&config, &runner, 1000);

        let err = install(&ctx, &BuildSelection::Full).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::PrivilegeRequired { .. })
        ));
        assert!(runner.calls().is_empty());
        assert!(!temp.path().join("src").exists());
    }

    #[test]
    fn uninstall_with_one_missing_path_warns_once() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = ScriptedRunner::new();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        let a = temp.path().join("usr/local/bin/badvpn-udpgw");
        let b = temp.path().join("etc/relayctl/udpgw.env");
        let gone = temp.path().join("usr/local/bin/badvpn-tun2socks");
        for path in [&a, &b] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        let bystander = temp.path().join("usr/local/bin/other-tool");
        fs::write(&bystander, "keep").unwrap();

        let mut manifest = InstallManifest::new();
        for path in [&a, &b, &gone] {
            manifest.record(path).unwrap();
        }
        let store = ManifestStore::new(config.paths.manifest_path());
        store.persist(&manifest).unwrap();

        let report = uninstall(&ctx).unwrap();
        assert_eq!(report.removal.removed.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(!a.exists() && !b.exists());
        assert!(bystander.exists());
        assert!(!store.exists());
    }

    #[test]
    fn uninstall_without_manifest_is_refused() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = ScriptedRunner::new();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        let err = uninstall(&ctx).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::ManifestMissing { .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn install_then_uninstall_leaves_no_artifacts() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = healthy_host();
        let ctx = DeployContext::with_euid(&config, &runner, 0);

        let report = install(&ctx, &BuildSelection::Full).unwrap();
        let installed: Vec<PathBuf> = report.binaries.iter().map(|b| b.path.clone()).collect();

        let removal = uninstall(&ctx).unwrap();
        assert!(removal.warnings.is_empty());
        for path in installed {
            assert!(!path.exists());
        }
        assert!(!config.paths.unit_path("udpgw").exists());
        assert!(!config.paths.metadata_path().exists());
        assert!(runner.called("systemctl stop udpgw"));
    }

    #[test]
    fn global_command_is_linked_and_recorded() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = ScriptedRunner::new();
        let ctx = DeployContext::with_euid(&config, &runner, 0);
        let exe = temp.path().join("relayctl-bin");
        fs::write(&exe, "").unwrap();

        let link = install_global(&ctx, &exe).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), exe);
        // Idempotent.
        install_global(&ctx, &exe).unwrap();

        let manifest = ManifestStore::new(config.paths.manifest_path())
            .load()
            .unwrap();
        assert_eq!(manifest.entries(), &[link]);
    }

    #[test]
    fn global_command_never_replaces_foreign_file() {
        let temp = TempDir::new().unwrap();
        let config = sandbox(temp.path());
        let runner = ScriptedRunner::new();
        let ctx = DeployContext::with_euid(&config, &runner, 0);
        let link = &config.paths.global_command;
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        fs::write(link, "someone else's script").unwrap();

        let err = install_global(&ctx, &temp.path().join("relayctl-bin")).unwrap_err();
        assert!(matches!(classify(&err), Some(DeployError::Conflict { .. })));
        assert_eq!(fs::read_to_string(link).unwrap(), "someone else's script");
    }
}
