//! Install manifest: the authoritative list of files an installation created.
//!
//! The manifest is an append-only log of absolute paths persisted as JSON at
//! `<state_dir>/manifest.json`. It is the only input to uninstall, which
//! removes exactly the recorded paths and nothing else.
//!
//! Writes go through a temporary file in the same directory followed by a
//! rename, so a reader sees either the previous manifest or the new one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Warning};

const MANIFEST_VERSION: u32 = 1;

/// Ordered, duplicate-free set of paths owned by one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    version: u32,
    entries: Vec<PathBuf>,
}

impl InstallManifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: Vec::new(),
        }
    }

    /// Append a path. Recording the same path twice is a no-op.
    pub fn record(&mut self, path: &Path) -> Result<()> {
        if !path.is_absolute() {
            bail!(
                "manifest entries must be absolute paths, got '{}'",
                path.display()
            );
        }
        if !self.contains(path) {
            self.entries.push(path.to_path_buf());
        }
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|entry| entry == path)
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InstallManifest {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`ManifestStore::remove_all`] did, entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: Vec<PathBuf>,
    /// Already gone before uninstall ran.
    pub missing: Vec<PathBuf>,
    /// Still present; removal failed (e.g. permission denied).
    pub failed: Vec<(PathBuf, String)>,
}

impl RemovalReport {
    /// Non-fatal problems to show the operator.
    pub fn warnings(&self) -> Vec<Warning> {
        let missing = self.missing.iter().map(|path| {
            Warning::new(
                "uninstall",
                format!("'{}' was already absent", path.display()),
            )
        });
        let failed = self.failed.iter().map(|(path, reason)| {
            Warning::new(
                "uninstall",
                format!("could not remove '{}': {}", path.display(), reason),
            )
        });
        missing.chain(failed).collect()
    }
}

/// Manifest persisted at a fixed location.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the manifest; [`DeployError::ManifestMissing`] if there is none.
    pub fn load(&self) -> Result<InstallManifest> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(DeployError::ManifestMissing {
                    path: self.path.clone(),
                }
                .into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading manifest '{}'", self.path.display()));
            }
        };
        let manifest: InstallManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing manifest '{}'", self.path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            bail!(
                "manifest '{}' has unsupported version {} (expected {})",
                self.path.display(),
                manifest.version,
                MANIFEST_VERSION
            );
        }
        Ok(manifest)
    }

    /// The persisted manifest, or an empty one on a fresh host.
    pub fn load_or_new(&self) -> Result<InstallManifest> {
        if self.exists() {
            self.load()
        } else {
            Ok(InstallManifest::new())
        }
    }

    /// Atomically replace the persisted manifest.
    pub fn persist(&self, manifest: &InstallManifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest).context("serializing manifest")?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("persisting manifest '{}'", self.path.display()))
    }

    /// Delete every recorded path that still exists, then the manifest itself.
    ///
    /// Missing entries and entries that cannot be removed are reported, not
    /// fatal. The manifest file is kept if any entry failed, so a later retry
    /// still knows what to remove.
    pub fn remove_all(&self) -> Result<RemovalReport> {
        let manifest = self.load()?;
        let mut report = RemovalReport::default();

        for path in manifest.entries() {
            match remove_entry(path) {
                Ok(true) => {
                    tracing::info!(path = %path.display(), "removed");
                    report.removed.push(path.clone());
                }
                Ok(false) => report.missing.push(path.clone()),
                Err(err) => report.failed.push((path.clone(), err.to_string())),
            }
        }

        if report.failed.is_empty() {
            fs::remove_file(&self.path)
                .with_context(|| format!("removing manifest '{}'", self.path.display()))?;
        } else {
            let remaining = InstallManifest {
                version: MANIFEST_VERSION,
                entries: report.failed.iter().map(|(p, _)| p.clone()).collect(),
            };
            self.persist(&remaining)?;
        }

        Ok(report)
    }
}

/// Remove one manifest entry. `Ok(false)` when it was already gone.
fn remove_entry(path: &Path) -> std::io::Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        // Only empty directories; a populated one holds files we never recorded.
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Write `bytes` to a sibling temp file, sync it, then rename over `dest`.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(dest)?;
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating '{}'", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing '{}'", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing '{}'", tmp.display()))?;
        fs::rename(&tmp, dest)
            .with_context(|| format!("renaming '{}' -> '{}'", tmp.display(), dest.display()))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// A not-yet-existing temp path next to `dest`, creating the parent if needed.
pub(crate) fn temp_sibling(dest: &Path) -> Result<PathBuf> {
    let parent = dest
        .parent()
        .with_context(|| format!("'{}' has no parent directory", dest.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating directory '{}'", parent.display()))?;
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("relayctl");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(parent.join(format!(".{name}.tmp-{}-{nanos}", std::process::id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn tree(root: &Path) -> BTreeSet<PathBuf> {
        let mut out = BTreeSet::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                out.insert(path);
            }
        }
        out
    }

    #[test]
    fn record_is_idempotent_and_ordered() {
        let mut manifest = InstallManifest::new();
        manifest.record(Path::new("/usr/local/bin/badvpn-udpgw")).unwrap();
        manifest.record(Path::new("/etc/systemd/system/udpgw.service")).unwrap();
        manifest.record(Path::new("/usr/local/bin/badvpn-udpgw")).unwrap();

        assert_eq!(
            manifest.entries(),
            &[
                PathBuf::from("/usr/local/bin/badvpn-udpgw"),
                PathBuf::from("/etc/systemd/system/udpgw.service"),
            ]
        );
    }

    #[test]
    fn record_rejects_relative_paths() {
        let mut manifest = InstallManifest::new();
        assert!(manifest.record(Path::new("bin/badvpn-udpgw")).is_err());
        assert!(manifest.is_empty());
    }

    #[test]
    fn persist_then_load() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::new(temp.path().join("state/manifest.json"));

        let mut manifest = InstallManifest::new();
        manifest.record(&temp.path().join("a")).unwrap();
        store.persist(&manifest).unwrap();

        assert_eq!(store.load().unwrap(), manifest);
        let leftovers: Vec<_> = fs::read_dir(temp.path().join("state"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temp file left behind: {leftovers:?}");
    }

    #[test]
    fn load_without_manifest_is_manifest_missing() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::new(temp.path().join("manifest.json"));

        let err = store.load().unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(DeployError::ManifestMissing { .. })
        ));
        assert!(store.remove_all().is_err());
        assert!(store.load_or_new().unwrap().is_empty());
    }

    #[test]
    fn remove_all_touches_only_manifest_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();

        let owned = [root.join("bin/badvpn-udpgw"), root.join("etc/udpgw.env")];
        let foreign = [root.join("bin/other-tool"), root.join("etc/keep.conf")];
        for path in owned.iter().chain(foreign.iter()) {
            fs::write(path, "x").unwrap();
        }

        let store = ManifestStore::new(temp.path().join("manifest.json"));
        let mut manifest = InstallManifest::new();
        for path in &owned {
            manifest.record(path).unwrap();
        }
        store.persist(&manifest).unwrap();

        let before: BTreeSet<_> = tree(&root);
        let report = store.remove_all().unwrap();

        assert_eq!(report.removed, owned.to_vec());
        assert!(report.warnings().is_empty());
        for path in &owned {
            assert!(!path.exists());
        }
        let expected: BTreeSet<_> = before
            .into_iter()
            .filter(|p| !owned.contains(p))
            .collect();
        assert_eq!(tree(&root), expected);
        assert!(!store.exists());
    }

    #[test]
    fn remove_all_warns_about_missing_entries() {
        let temp = TempDir::new().unwrap();
        let paths = [
            temp.path().join("badvpn-udpgw"),
            temp.path().join("udpgw.service"),
            temp.path().join("udpgw.env"),
        ];
        fs::write(&paths[0], "bin").unwrap();
        fs::write(&paths[2], "env").unwrap();

        let store = ManifestStore::new(temp.path().join("manifest.json"));
        let mut manifest = InstallManifest::new();
        for path in &paths {
            manifest.record(path).unwrap();
        }
        store.persist(&manifest).unwrap();

        let report = store.remove_all().unwrap();
        assert_eq!(report.removed, vec![paths[0].clone(), paths[2].clone()]);
        assert_eq!(report.missing, vec![paths[1].clone()]);
        let warnings = report.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("udpgw.service"));
        assert!(!store.exists());
    }

    #[test]
    fn remove_all_keeps_undeletable_entries_recorded() {
        let temp = TempDir::new().unwrap();
        let populated = temp.path().join("populated");
        fs::create_dir_all(&populated).unwrap();
        fs::write(populated.join("unrecorded"), "x").unwrap();
        let file = temp.path().join("badvpn-udpgw");
        fs::write(&file, "bin").unwrap();

        let store = ManifestStore::new(temp.path().join("manifest.json"));
        let mut manifest = InstallManifest::new();
        manifest.record(&file).unwrap();
        manifest.record(&populated).unwrap();
        store.persist(&manifest).unwrap();

        let report = store.remove_all().unwrap();
        assert_eq!(report.removed, vec![file.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert!(populated.join("unrecorded").exists());
        assert_eq!(store.load().unwrap().entries(), &[populated]);
    }
}
