//! External command plumbing.
//!
//! Every call into git, cmake, systemd, the package manager, the ACME client
//! and the panel goes through a [`Cmd`] executed by a [`Runner`]. The system
//! runner spawns real processes; tests swap in a scripted one.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::error::DeployError;

/// Executes commands on behalf of the deployment components.
pub trait Runner {
    /// Run with captured stdout/stderr.
    fn output(&self, cmd: &Cmd) -> Result<CmdResult>;

    /// Run attached to the caller's terminal. Captured streams are empty.
    fn attached(&self, cmd: &Cmd) -> Result<CmdResult>;

    /// Resolve a program name through PATH.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runner backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn output(&self, cmd: &Cmd) -> Result<CmdResult> {
        tracing::debug!(command = %cmd.display(), "running");
        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning `{}`", cmd.display()))?;
        Ok(CmdResult {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn attached(&self, cmd: &Cmd) -> Result<CmdResult> {
        tracing::debug!(command = %cmd.display(), "running attached");
        let status = cmd
            .to_command()
            .status()
            .with_context(|| format!("spawning `{}`", cmd.display()))?;
        Ok(CmdResult {
            code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Outcome of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for tools that report errors on either.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    fn status_label(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Command builder.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Treat a non-zero exit as a normal result instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments as lossy UTF-8, mostly for matching in tests and logs.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.arg_strings());
        parts.join(" ")
    }

    /// Run with captured output. Non-zero exit is an error unless
    /// [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn Runner) -> Result<CmdResult> {
        let result = runner.output(self)?;
        self.check(result)
    }

    /// Run attached to the terminal, with the same exit handling as [`Cmd::run`].
    pub fn run_attached(&self, runner: &dyn Runner) -> Result<CmdResult> {
        let result = runner.attached(self)?;
        self.check(result)
    }

    fn check(&self, result: CmdResult) -> Result<CmdResult> {
        if result.success() || self.allow_fail {
            return Ok(result);
        }
        Err(DeployError::CommandFailed {
            command: self.display(),
            status: result.status_label(),
            stderr: result.stderr.trim().to_string(),
        }
        .into())
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn test_system_runner_captures_output() {
        let result = Cmd::new("echo")
            .arg("hello")
            .run(&SystemRunner)
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_is_command_failed() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run(&SystemRunner)
            .unwrap_err();
        match classify(&err) {
            Some(DeployError::CommandFailed { status, stderr, .. }) => {
                assert_eq!(status, "exit status 3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_allow_fail_returns_result() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run(&SystemRunner)
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.code, Some(1));
    }

    #[test]
    fn test_display_joins_program_and_args() {
        let cmd = Cmd::new("systemctl").args(["restart", "udpgw"]);
        assert_eq!(cmd.display(), "systemctl restart udpgw");
    }
}
