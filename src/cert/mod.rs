//! TLS certificate issuance for the web panel.
//!
//! Preconditions are checked in a fixed order and short-circuit before
//! anything is requested from the CA:
//!
//! 1. the panel binary is installed
//! 2. acme.sh is installed (fetched on demand)
//! 3. the HTTP challenge port is free
//! 4. the domain has no existing issuance, unless forced
//!
//! Issued material lives under `<cert_root>/<domain>/` next to a
//! `record.json`. A failure after issuance starts removes the files this run
//! wrote there, and the directory too if this run created it.

pub mod acme;
pub mod panel;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::DeployContext;
use crate::error::{best_effort, DeployError, Warning};
use crate::manifest::write_atomic;
use crate::preflight::{begin_mutation, port_in_use};
use crate::provision::ensure_tools;

pub use acme::AcmeClient;
pub use panel::{Panel, PanelSettings};

pub const RECORD_FILENAME: &str = "record.json";
const FULLCHAIN_FILENAME: &str = "fullchain.cer";
const KEY_FILENAME: &str = "private.key";

/// A completed issuance, persisted as `record.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    /// RFC 3339.
    pub issued_at: String,
}

impl CertificateRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading '{}'", path.display()))
            }
        };
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("parsing certificate record '{}'", path.display()))?;
        Ok(Some(record))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
    }
}

/// Where a domain's certificate material lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLayout {
    pub dir: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub record: PathBuf,
}

impl DomainLayout {
    pub fn new(cert_root: &Path, domain: &str) -> Self {
        let dir = cert_root.join(domain);
        Self {
            certificate: dir.join(FULLCHAIN_FILENAME),
            private_key: dir.join(KEY_FILENAME),
            record: dir.join(RECORD_FILENAME),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CertRequest {
    pub domain: String,
    pub force: bool,
}

#[derive(Debug)]
pub struct IssuedCertificate {
    pub record: CertificateRecord,
    pub access_url: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Normalize and check a DNS name: lowercase, at least two labels, each
/// 1 to 63 characters of letters, digits and inner hyphens.
pub fn validate_domain(raw: &str) -> Result<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| -> anyhow::Error {
        DeployError::invalid("domain", format!("'{}' {reason}", raw.trim())).into()
    };

    if domain.is_empty() {
        return Err(invalid("is empty"));
    }
    if domain.len() > 253 {
        return Err(invalid("is longer than 253 characters"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("is not a fully qualified name"));
    }
    for label in &labels {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(invalid(&format!("has an invalid label '{label}'")));
        }
    }
    if labels.iter().all(|l| l.chars().all(|c| c.is_ascii_digit())) {
        return Err(invalid("is an IP address, not a domain"));
    }
    Ok(domain)
}

/// Run the full issuance workflow for `request.domain`.
pub fn issue_certificate(ctx: &DeployContext<'_>, request: &CertRequest) -> Result<IssuedCertificate> {
    let domain = validate_domain(&request.domain)?;
    let _lock = begin_mutation(ctx)?;
    let acme_cfg = &ctx.config.acme;

    let panel = Panel::new(ctx.runner, &ctx.config.panel.binary, &ctx.config.panel.service);
    if !panel.present() {
        return Err(DeployError::DependencyUnavailable {
            name: panel.binary().display().to_string(),
            reason: "the web panel is not installed".to_string(),
        }
        .into());
    }

    let acme = AcmeClient::new(ctx.runner, &acme_cfg.client);
    if !acme.present() {
        ensure_tools(ctx, &[("curl", "curl")])?;
        acme.install(&acme_cfg.install_url, acme_cfg.email.as_deref())?;
        if !acme.present() {
            return Err(DeployError::DependencyUnavailable {
                name: acme_cfg.client.display().to_string(),
                reason: "acme.sh is still missing after installation".to_string(),
            }
            .into());
        }
    }

    let port = acme_cfg.challenge_port;
    if port_in_use(port) {
        return Err(DeployError::PortBlocked { port }.into());
    }

    let layout = DomainLayout::new(&acme_cfg.cert_root, &domain);
    let listed = acme.list()?.contains(&domain);
    let recorded = CertificateRecord::load(&layout.record)?.is_some();
    if (listed || recorded) && !request.force {
        return Err(DeployError::AlreadyIssued { domain }.into());
    }

    // Standalone mode serves the challenge through socat on older acme.sh.
    ensure_tools(ctx, &[("socat", "socat")])?;

    let created_dir = !layout.dir.exists();
    fs::create_dir_all(&layout.dir)
        .with_context(|| format!("creating '{}'", layout.dir.display()))?;

    let mut warnings: Vec<Warning> = best_effort("set-default-ca", acme.set_default_ca(&acme_cfg.ca))
        .into_iter()
        .collect();

    tracing::info!(%domain, port, "requesting certificate");
    let mut written = Vec::new();
    let outcome = obtain(&acme, &panel, &domain, port, request.force, &layout, &mut written);
    let record = match outcome {
        Ok(record) => record,
        Err(err) => {
            cleanup(&acme, &domain, &layout, &written, created_dir, listed);
            return Err(err);
        }
    };
    tracing::info!(%domain, cert = %record.certificate.display(), "certificate issued");

    warnings.extend(best_effort("panel-restart", panel.restart()));
    let access_url = match panel.settings() {
        Ok(settings) => Some(settings.access_url(&domain)),
        Err(err) => {
            warnings.extend(best_effort::<()>("panel-settings", Err(err)));
            None
        }
    };

    Ok(IssuedCertificate {
        record,
        access_url,
        warnings,
    })
}

/// Issue, install and record a certificate, then hand it to the panel.
///
/// Every path this run may have written is pushed to `written` before the
/// step that writes it, so a failure can be cleaned up precisely.
fn obtain(
    acme: &AcmeClient<'_>,
    panel: &Panel<'_>,
    domain: &str,
    port: u16,
    force: bool,
    layout: &DomainLayout,
    written: &mut Vec<PathBuf>,
) -> Result<CertificateRecord> {
    let result = acme.issue(domain, port, force)?;
    if !result.success() {
        return Err(acme::classify_issue_failure(domain, port, &result).into());
    }

    written.push(layout.certificate.clone());
    written.push(layout.private_key.clone());
    acme.install_cert(domain, &layout.private_key, &layout.certificate)?;
    for path in [&layout.certificate, &layout.private_key] {
        if !path.is_file() {
            return Err(DeployError::Issuance {
                domain: domain.to_string(),
                detail: format!("acme.sh did not produce '{}'", path.display()),
            }
            .into());
        }
    }

    let issued_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting issuance time")?;
    let record = CertificateRecord {
        domain: domain.to_string(),
        certificate: layout.certificate.clone(),
        private_key: layout.private_key.clone(),
        issued_at,
    };
    written.push(layout.record.clone());
    record.persist(&layout.record)?;

    // The panel only ever sees paths that already have a record.
    panel.install_cert(&layout.certificate, &layout.private_key)?;
    Ok(record)
}

fn cleanup(
    acme: &AcmeClient<'_>,
    domain: &str,
    layout: &DomainLayout,
    written: &[PathBuf],
    created_dir: bool,
    was_listed: bool,
) {
    for path in written {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), "failed to remove certificate artifact: {}", err)
            }
        }
    }
    if created_dir {
        if let Err(err) = fs::remove_dir_all(&layout.dir) {
            tracing::warn!(dir = %layout.dir.display(), "failed to remove certificate directory: {}", err);
        }
    }
    if !was_listed {
        best_effort("acme-remove", acme.remove(domain));
    }
}
