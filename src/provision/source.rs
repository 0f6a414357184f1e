//! Local source checkout management.
//!
//! `sync_source` brings `target_dir` to the tip of the requested upstream ref:
//!
//! - missing or empty directory: fresh clone
//! - checkout of the configured remote: fetch, then force-checkout the ref
//! - anything else with content: [`DeployError::Conflict`], never overwritten
//!
//! After syncing, the build descriptor must exist or the sync fails with
//! [`DeployError::MissingBuildDescriptor`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::DeployContext;
use crate::error::DeployError;
use crate::process::Cmd;

/// File the build orchestrator needs at the checkout root.
pub const BUILD_DESCRIPTOR: &str = "CMakeLists.txt";

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub repo_url: String,
    pub target_dir: PathBuf,
    pub preferred_ref: String,
    pub fallback_ref: Option<String>,
}

impl SourceSpec {
    pub fn from_context(ctx: &DeployContext<'_>) -> Self {
        Self {
            repo_url: ctx.config.source.repo_url.clone(),
            target_dir: ctx.paths().source_dir.clone(),
            preferred_ref: ctx.config.source.preferred_ref.clone(),
            fallback_ref: ctx.config.source.fallback_ref.clone(),
        }
    }

    fn candidate_refs(&self) -> Vec<&str> {
        let mut refs = vec![self.preferred_ref.as_str()];
        if let Some(fallback) = self.fallback_ref.as_deref() {
            if fallback != self.preferred_ref {
                refs.push(fallback);
            }
        }
        refs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned,
    Updated,
}

/// Checkout state after a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceState {
    pub dir: PathBuf,
    pub git_ref: String,
    pub commit: String,
    pub outcome: SyncOutcome,
}

pub fn sync_source(ctx: &DeployContext<'_>, spec: &SourceSpec) -> Result<SourceState> {
    let target = spec.target_dir.as_path();

    let outcome = if !target.exists() || is_empty_dir(target)? {
        clone_fresh(ctx, spec)?;
        SyncOutcome::Cloned
    } else if is_checkout(ctx, target) {
        ensure_same_remote(ctx, spec)?;
        tracing::info!(dir = %target.display(), "fetching upstream changes");
        git(target)
            .args(["fetch", "--prune", "origin"])
            .run(ctx.runner)
            .with_context(|| format!("fetching updates into '{}'", target.display()))?;
        SyncOutcome::Updated
    } else {
        return Err(DeployError::Conflict {
            path: target.to_path_buf(),
            reason: "directory is not empty and is not a git checkout".to_string(),
        }
        .into());
    };

    let git_ref = resolve_ref(ctx, spec)?;
    let remote_ref = format!("origin/{git_ref}");
    git(target)
        .args(["checkout", "--force", "-B", git_ref.as_str(), remote_ref.as_str()])
        .run(ctx.runner)
        .with_context(|| format!("checking out '{remote_ref}' in '{}'", target.display()))?;

    let commit = git(target)
        .args(["rev-parse", "HEAD"])
        .run(ctx.runner)
        .with_context(|| format!("reading HEAD of '{}'", target.display()))?
        .stdout
        .trim()
        .to_string();

    let descriptor = target.join(BUILD_DESCRIPTOR);
    if !descriptor.is_file() {
        return Err(DeployError::MissingBuildDescriptor { path: descriptor }.into());
    }

    tracing::info!(git_ref = %git_ref, commit = %commit, "source at desired revision");
    Ok(SourceState {
        dir: target.to_path_buf(),
        git_ref,
        commit,
        outcome,
    })
}

fn git(dir: &Path) -> Cmd {
    Cmd::new("git").arg("-C").arg_path(dir)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    let mut entries =
        fs::read_dir(path).with_context(|| format!("reading directory '{}'", path.display()))?;
    Ok(entries.next().is_none())
}

fn is_checkout(ctx: &DeployContext<'_>, dir: &Path) -> bool {
    if !dir.join(".git").exists() {
        return false;
    }
    git(dir)
        .args(["rev-parse", "--git-dir"])
        .allow_fail()
        .run(ctx.runner)
        .map(|result| result.success())
        .unwrap_or(false)
}

fn ensure_same_remote(ctx: &DeployContext<'_>, spec: &SourceSpec) -> Result<()> {
    let result = git(&spec.target_dir)
        .args(["remote", "get-url", "origin"])
        .allow_fail()
        .run(ctx.runner)?;
    let actual = result.stdout.trim();
    if result.success() && actual == spec.repo_url {
        return Ok(());
    }
    Err(DeployError::Conflict {
        path: spec.target_dir.clone(),
        reason: if result.success() {
            format!("checkout tracks '{}', expected '{}'", actual, spec.repo_url)
        } else {
            "checkout has no 'origin' remote".to_string()
        },
    }
    .into())
}

fn clone_fresh(ctx: &DeployContext<'_>, spec: &SourceSpec) -> Result<()> {
    let target = spec.target_dir.as_path();
    let existed = target.exists();
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }

    tracing::info!(url = %spec.repo_url, dir = %target.display(), "cloning source");
    let result = Cmd::new("git")
        .arg("clone")
        .arg(&spec.repo_url)
        .arg_path(target)
        .run(ctx.runner);

    if let Err(err) = result {
        if !existed && target.exists() {
            let _ = fs::remove_dir_all(target);
        }
        return Err(err).with_context(|| format!("cloning '{}'", spec.repo_url));
    }
    Ok(())
}

fn resolve_ref(ctx: &DeployContext<'_>, spec: &SourceSpec) -> Result<String> {
    let candidates = spec.candidate_refs();
    for candidate in &candidates {
        let found = git(&spec.target_dir)
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/remotes/origin/{candidate}"))
            .allow_fail()
            .run(ctx.runner)?
            .success();
        if found {
            if *candidate != spec.preferred_ref {
                tracing::warn!(
                    preferred = %spec.preferred_ref,
                    fallback = %candidate,
                    "preferred ref not found upstream, using fallback"
                );
            }
            return Ok(candidate.to_string());
        }
    }
    Err(DeployError::SourceSync(format!(
        "none of the refs [{}] exist on '{}'",
        candidates.join(", "),
        spec.repo_url
    ))
    .into())
}
