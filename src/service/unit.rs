//! systemd unit generation for the UDP gateway.
//!
//! The unit is staged in a temp file next to its destination, re-read and
//! validated, and only then renamed into place. A staged file that fails
//! validation is removed, leaving whatever unit was there before.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::DeployContext;
use crate::control::Supervisor;
use crate::error::{best_effort, Warning};
use crate::manifest::temp_sibling;

const REQUIRED_SECTIONS: [&str; 3] = ["[Unit]", "[Service]", "[Install]"];

/// Result of [`generate`].
#[derive(Debug)]
pub struct GeneratedUnit {
    pub path: PathBuf,
    pub warnings: Vec<Warning>,
}

/// Render the unit text for `binary`, reading its settings from `env_file`.
pub fn render_unit(binary: &Path, env_file: &Path) -> String {
    format!(
        "[Unit]\n\
         Description=badvpn UDP gateway\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile={env}\n\
         ExecStart={bin} --listen-addr ${{LISTEN_ADDR}} --max-clients ${{MAX_CLIENTS}} \
         --max-connections-for-client ${{MAX_CONNECTIONS_FOR_CLIENT}} --loglevel warning\n\
         Restart=always\n\
         RestartSec=3\n\
         LimitNOFILE=65535\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        env = env_file.display(),
        bin = binary.display(),
    )
}

/// Check that `text` is a complete unit for `binary` and `env_file`.
pub fn validate_unit(text: &str, binary: &Path, env_file: &Path) -> Result<()> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();

    for section in REQUIRED_SECTIONS {
        if !lines.contains(&section) {
            bail!("unit is missing the {} section", section);
        }
    }

    let exec = lines
        .iter()
        .find_map(|l| l.strip_prefix("ExecStart="))
        .context("unit has no ExecStart= line")?;
    let program = exec.split_whitespace().next().unwrap_or_default();
    if Path::new(program) != binary {
        bail!(
            "ExecStart= runs '{}', expected '{}'",
            program,
            binary.display()
        );
    }

    let env = lines
        .iter()
        .find_map(|l| l.strip_prefix("EnvironmentFile="))
        .context("unit has no EnvironmentFile= line")?;
    if Path::new(env.trim_start_matches('-')) != env_file {
        bail!(
            "EnvironmentFile= points at '{}', expected '{}'",
            env,
            env_file.display()
        );
    }

    Ok(())
}

/// Write `content` to a fresh temp file next to `dest`.
pub(crate) fn stage_unit(dest: &Path, content: &str) -> Result<PathBuf> {
    let tmp = temp_sibling(dest)?;
    let written = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating '{}'", tmp.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("writing '{}'", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing '{}'", tmp.display()))
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(tmp)
}

/// Validate the staged unit at `tmp` from disk, then move it over `dest`.
///
/// On any failure `tmp` is removed and `dest` is left untouched.
pub(crate) fn commit_unit(tmp: &Path, dest: &Path, binary: &Path, env_file: &Path) -> Result<()> {
    let result = fs::read_to_string(tmp)
        .with_context(|| format!("re-reading staged unit '{}'", tmp.display()))
        .and_then(|text| validate_unit(&text, binary, env_file))
        .with_context(|| format!("staged unit for '{}' is invalid", dest.display()))
        .and_then(|()| {
            fs::rename(tmp, dest)
                .with_context(|| format!("renaming '{}' -> '{}'", tmp.display(), dest.display()))
        });
    if result.is_err() {
        let _ = fs::remove_file(tmp);
    }
    result
}

/// Generate the unit for the configured service, then reload systemd.
///
/// The unit is always rewritten. The reload is best-effort and reported as a
/// warning when it fails.
pub fn generate(ctx: &DeployContext<'_>, binary: &Path, env_file: &Path) -> Result<GeneratedUnit> {
    let dest = ctx.paths().unit_path(ctx.service_name());
    let tmp = stage_unit(&dest, &render_unit(binary, env_file))?;
    commit_unit(&tmp, &dest, binary, env_file)?;
    tracing::info!(unit = %dest.display(), "service unit written");

    let warnings = best_effort("daemon-reload", Supervisor::new(ctx.runner).daemon_reload())
        .into_iter()
        .collect();
    Ok(GeneratedUnit {
        path: dest,
        warnings,
    })
}
