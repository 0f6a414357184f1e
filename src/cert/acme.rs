//! acme.sh wrapper.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::build::is_executable_file;
use crate::error::DeployError;
use crate::process::{Cmd, CmdResult, Runner};

pub struct AcmeClient<'r> {
    runner: &'r dyn Runner,
    script: PathBuf,
}

impl<'r> AcmeClient<'r> {
    pub fn new(runner: &'r dyn Runner, script: &Path) -> Self {
        Self {
            runner,
            script: script.to_path_buf(),
        }
    }

    pub fn present(&self) -> bool {
        is_executable_file(&self.script)
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(self.script.to_string_lossy())
    }

    /// Fetch and run the acme.sh installer.
    pub fn install(&self, install_url: &str, email: Option<&str>) -> Result<()> {
        let mut pipeline = format!("curl -fsSL '{install_url}' | sh -s");
        if let Some(email) = email {
            pipeline.push_str(&format!(" email='{email}'"));
        }
        tracing::info!(url = install_url, "installing acme.sh");
        Cmd::new("sh")
            .args(["-c", &pipeline])
            .run(self.runner)
            .context("installing acme.sh")?;
        Ok(())
    }

    /// Main domains acme.sh already manages.
    pub fn list(&self) -> Result<Vec<String>> {
        let result = self
            .cmd()
            .arg("--list")
            .run(self.runner)
            .context("listing acme.sh certificates")?;
        Ok(parse_list(&result.stdout))
    }

    pub fn set_default_ca(&self, ca: &str) -> Result<()> {
        self.cmd()
            .args(["--set-default-ca", "--server", ca])
            .run(self.runner)
            .with_context(|| format!("setting default CA to {ca}"))?;
        Ok(())
    }

    /// Run a standalone HTTP-01 issuance. The raw result is returned so the
    /// caller can classify failures.
    pub fn issue(&self, domain: &str, http_port: u16, force: bool) -> Result<CmdResult> {
        let mut cmd = self
            .cmd()
            .args(["--issue", "-d", domain, "--standalone", "--httpport"])
            .arg(http_port.to_string());
        if force {
            cmd = cmd.arg("--force");
        }
        cmd.allow_fail().run(self.runner)
    }

    pub fn install_cert(&self, domain: &str, key: &Path, fullchain: &Path) -> Result<()> {
        self.cmd()
            .args(["--installcert", "-d", domain, "--key-file"])
            .arg_path(key)
            .arg("--fullchain-file")
            .arg_path(fullchain)
            .run(self.runner)
            .with_context(|| format!("installing certificate for {domain}"))?;
        Ok(())
    }

    pub fn remove(&self, domain: &str) -> Result<()> {
        self.cmd()
            .args(["--remove", "-d", domain])
            .run(self.runner)
            .with_context(|| format!("removing {domain} from acme.sh"))?;
        Ok(())
    }
}

/// First column of `acme.sh --list`, header skipped.
pub fn parse_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|first| !first.eq_ignore_ascii_case("Main_Domain"))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Categorize a failed `--issue` from its output.
pub fn classify_issue_failure(domain: &str, http_port: u16, result: &CmdResult) -> DeployError {
    let output = result.combined();
    let lower = output.to_ascii_lowercase();
    let detail = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("acme.sh exited without output")
        .to_string();

    const DNS: [&str; 5] = [
        "verify error",
        "dns problem",
        "nxdomain",
        "invalid response",
        "no valid ip addresses",
    ];
    if DNS.iter().any(|needle| lower.contains(needle)) {
        return DeployError::DnsNotPointed {
            domain: domain.to_string(),
            detail,
        };
    }
    if lower.contains("address already in use") || lower.contains("is already used") {
        return DeployError::PortBlocked { port: http_port };
    }
    if lower.contains("domains not changed") || lower.contains("skip, next renewal time") {
        return DeployError::AlreadyIssued {
            domain: domain.to_string(),
        };
    }
    DeployError::Issuance {
        domain: domain.to_string(),
        detail,
    }
}
