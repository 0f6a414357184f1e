//! The web panel that consumes the issued certificate.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::build::is_executable_file;
use crate::control::Supervisor;
use crate::process::{Cmd, Runner};

/// Panel settings relevant for building its access URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelSettings {
    pub port: Option<u16>,
    pub base_path: Option<String>,
}

impl PanelSettings {
    /// Parse `setting -show true` output (`key: value` lines).
    pub fn parse(output: &str) -> Self {
        let mut settings = Self::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key.ends_with("port") && settings.port.is_none() {
                settings.port = value.parse().ok();
            } else if key.ends_with("webbasepath") && !value.is_empty() {
                settings.base_path = Some(value.to_string());
            }
        }
        settings
    }

    pub fn access_url(&self, domain: &str) -> String {
        let mut url = format!("https://{domain}");
        if let Some(port) = self.port {
            url.push_str(&format!(":{port}"));
        }
        let base = self
            .base_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .unwrap_or("");
        url.push('/');
        if !base.is_empty() {
            url.push_str(base);
            url.push('/');
        }
        url
    }
}

pub struct Panel<'r> {
    runner: &'r dyn Runner,
    binary: PathBuf,
    service: String,
}

impl<'r> Panel<'r> {
    pub fn new(runner: &'r dyn Runner, binary: &Path, service: &str) -> Self {
        Self {
            runner,
            binary: binary.to_path_buf(),
            service: service.to_string(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn present(&self) -> bool {
        is_executable_file(&self.binary)
    }

    pub fn settings(&self) -> Result<PanelSettings> {
        let result = Cmd::new(self.binary.to_string_lossy())
            .args(["setting", "-show", "true"])
            .run(self.runner)
            .context("reading panel settings")?;
        Ok(PanelSettings::parse(&result.stdout))
    }

    pub fn install_cert(&self, fullchain: &Path, key: &Path) -> Result<()> {
        Cmd::new(self.binary.to_string_lossy())
            .args(["cert", "-webCert"])
            .arg_path(fullchain)
            .arg("-webCertKey")
            .arg_path(key)
            .run(self.runner)
            .context("configuring panel certificate")?;
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        Supervisor::new(self.runner).restart(&self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_parsed_from_show_output() {
        let out = "current panel settings as follows:\n\
                   hasDefaultCredential: false\n\
                   port: 54321\n\
                   webBasePath: /secret/\n";
        let settings = PanelSettings::parse(out);
        assert_eq!(settings.port, Some(54321));
        assert_eq!(settings.base_path.as_deref(), Some("/secret/"));
        assert_eq!(
            settings.access_url("panel.example.com"),
            "https://panel.example.com:54321/secret/"
        );
    }

    #[test]
    fn url_without_settings_is_bare_domain() {
        assert_eq!(
            PanelSettings::default().access_url("panel.example.com"),
            "https://panel.example.com/"
        );
    }
}
