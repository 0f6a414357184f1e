//! Operational control of the installed gateway service.
//!
//! [`Supervisor`] is a thin typed layer over `systemctl`, `journalctl` and
//! `ss`. [`ControlSurface`] adds the operator workflows on top: privilege and
//! lock checks for anything that changes state, config edits followed by a
//! best-effort reload and restart, and state reporting.

use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::build::Component;
use crate::config::DeployContext;
use crate::error::{best_effort, Warning};
use crate::preflight::{begin_mutation, command_exists};
use crate::process::{Cmd, Runner};
use crate::service::{set_field_in_file, Field, ServiceConfig};

/// Observed state of a supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unknown,
    Stopped,
    Running,
    Failed,
}

impl ServiceState {
    /// Map `systemctl is-active` output to a state.
    pub fn from_is_active(output: &str) -> Self {
        match output.trim() {
            "active" | "activating" | "reloading" => Self::Running,
            "inactive" | "deactivating" => Self::Stopped,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unknown => "unknown",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// systemd operations for arbitrary units.
pub struct Supervisor<'r> {
    runner: &'r dyn Runner,
}

impl<'r> Supervisor<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self { runner }
    }

    fn systemctl(&self, verb: &str, unit: &str) -> Result<()> {
        Cmd::new("systemctl")
            .args([verb, unit])
            .run(self.runner)
            .with_context(|| format!("systemctl {verb} {unit}"))?;
        Ok(())
    }

    pub fn daemon_reload(&self) -> Result<()> {
        Cmd::new("systemctl")
            .arg("daemon-reload")
            .run(self.runner)
            .context("systemctl daemon-reload")?;
        Ok(())
    }

    pub fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl("enable", unit)
    }

    pub fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl("disable", unit)
    }

    pub fn start(&self, unit: &str) -> Result<()> {
        self.systemctl("start", unit)
    }

    pub fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl("stop", unit)
    }

    pub fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl("restart", unit)
    }

    pub fn state(&self, unit: &str) -> Result<ServiceState> {
        // is-active exits non-zero for anything but "active".
        let result = Cmd::new("systemctl")
            .args(["is-active", unit])
            .allow_fail()
            .run(self.runner)?;
        Ok(ServiceState::from_is_active(&result.stdout))
    }

    /// `systemctl status` text; the exit code only encodes the state.
    pub fn status_text(&self, unit: &str) -> Result<String> {
        let result = Cmd::new("systemctl")
            .args(["status", unit, "--no-pager"])
            .allow_fail()
            .run(self.runner)?;
        Ok(result.combined())
    }

    pub fn journal(&self, unit: &str, lines: usize) -> Result<String> {
        let result = Cmd::new("journalctl")
            .args(["-u", unit, "-n", &lines.to_string(), "--no-pager"])
            .run(self.runner)
            .with_context(|| format!("reading journal for {unit}"))?;
        Ok(result.stdout)
    }

    /// Stream the journal to the terminal until the operator interrupts it.
    pub fn follow(&self, unit: &str) -> Result<()> {
        // Ctrl-C ends journalctl by signal; that is the normal way out.
        Cmd::new("journalctl")
            .args(["-u", unit, "-f"])
            .allow_fail()
            .run_attached(self.runner)?;
        Ok(())
    }

    /// Listening sockets owned by a process whose name contains `process`.
    pub fn listening_sockets(&self, process: &str) -> Result<Vec<String>> {
        let result = Cmd::new("ss")
            .arg("-lntup")
            .run(self.runner)
            .context("listing listening sockets")?;
        let needle = format!("\"{process}");
        Ok(result
            .stdout
            .lines()
            .filter(|line| line.contains(&needle))
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub detail: String,
}

/// Outcome of a config change: the value written plus any follow-up failures.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
    pub field: Option<(Field, String)>,
    pub warnings: Vec<Warning>,
}

/// Operator workflows for the configured gateway service.
pub struct ControlSurface<'c, 'a> {
    ctx: &'c DeployContext<'a>,
}

impl<'c, 'a> ControlSurface<'c, 'a> {
    pub fn new(ctx: &'c DeployContext<'a>) -> Self {
        Self { ctx }
    }

    fn supervisor(&self) -> Supervisor<'a> {
        Supervisor::new(self.ctx.runner)
    }

    fn unit(&self) -> &str {
        self.ctx.service_name()
    }

    fn config_path(&self) -> PathBuf {
        self.ctx.paths().service_config_path(self.unit())
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        let supervisor = self.supervisor();
        Ok(ServiceStatus {
            state: supervisor.state(self.unit())?,
            detail: supervisor.status_text(self.unit())?,
        })
    }

    pub fn tail_logs(&self, lines: usize) -> Result<String> {
        self.supervisor().journal(self.unit(), lines)
    }

    pub fn follow_logs(&self) -> Result<()> {
        self.supervisor().follow(self.unit())
    }

    pub fn start(&self) -> Result<()> {
        let _lock = begin_mutation(self.ctx)?;
        self.supervisor().start(self.unit())
    }

    pub fn stop(&self) -> Result<()> {
        let _lock = begin_mutation(self.ctx)?;
        self.supervisor().stop(self.unit())
    }

    pub fn restart(&self) -> Result<()> {
        let _lock = begin_mutation(self.ctx)?;
        self.supervisor().restart(self.unit())
    }

    pub fn ports(&self) -> Result<Vec<String>> {
        self.supervisor()
            .listening_sockets(Component::Udpgw.binary_name())
    }

    /// Open the runtime config in `editor`, validate the result, then reload
    /// and restart the service.
    ///
    /// An edit that no longer parses is reported as an error and the service
    /// is left running with its previous settings.
    pub fn edit_config(&self, editor: &str) -> Result<ConfigChange> {
        let _lock = begin_mutation(self.ctx)?;
        let path = self.require_config()?;

        let mut words = editor.split_whitespace();
        let program = words.next().context("editor command is empty")?;
        Cmd::new(program)
            .args(words)
            .arg_path(&path)
            .run_attached(self.ctx.runner)
            .with_context(|| format!("editing '{}'", path.display()))?;

        ServiceConfig::load(&path)?;
        let warnings = self.apply();
        Ok(ConfigChange {
            path,
            field: None,
            warnings,
        })
    }

    /// Rewrite one field of the runtime config, then reload and restart.
    ///
    /// The change stays persisted even when the restart fails; that failure
    /// comes back as a warning.
    pub fn set_field(&self, name: &str, value: &str) -> Result<ConfigChange> {
        let field = Field::from_key(name)?;
        let normalized = field.validate(value)?;

        let _lock = begin_mutation(self.ctx)?;
        let path = self.require_config()?;
        let written = set_field_in_file(&path, field, &normalized)?;
        tracing::info!(field = field.key(), value = %written, "service config updated");

        let warnings = self.apply();
        Ok(ConfigChange {
            path,
            field: Some((field, written)),
            warnings,
        })
    }

    pub fn set_listen_addr(&self, addr: &str) -> Result<ConfigChange> {
        self.set_field(Field::ListenAddr.key(), addr)
    }

    fn require_config(&self) -> Result<PathBuf> {
        let path = self.config_path();
        if !path.is_file() {
            bail!(
                "service config '{}' does not exist; run `relayctl install` first",
                path.display()
            );
        }
        Ok(path)
    }

    fn apply(&self) -> Vec<Warning> {
        let supervisor = self.supervisor();
        let mut warnings = Vec::new();
        warnings.extend(best_effort("daemon-reload", supervisor.daemon_reload()));
        warnings.extend(best_effort("restart", supervisor.restart(self.unit())));
        warnings
    }
}

/// Pick an editor: `$VISUAL`, then `$EDITOR`, then `nano` or `vi` if present.
pub fn resolve_editor(
    visual: Option<String>,
    editor: Option<String>,
    runner: &dyn Runner,
) -> Option<String> {
    [visual, editor]
        .into_iter()
        .flatten()
        .find(|e| !e.trim().is_empty())
        .or_else(|| {
            ["nano", "vi"]
                .into_iter()
                .find(|e| command_exists(runner, e))
                .map(str::to_string)
        })
}

/// Editor from the process environment.
pub fn editor_from_env(runner: &dyn Runner) -> Option<String> {
    resolve_editor(
        std::env::var("VISUAL").ok(),
        std::env::var("EDITOR").ok(),
        runner,
    )
}

/// Path of the runtime config for display in menus and messages.
pub fn config_location(ctx: &DeployContext<'_>) -> PathBuf {
    ctx.paths().service_config_path(ctx.service_name())
}
