use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use verbosio::verbose;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Result, TpmError};
use crate::extract;
use crate::manifest::ToolId;
use crate::transaction::{self, Transaction};
use crate::version;

pub const STORE_META_FILE: &str = "manifest.json";

/// Per-version metadata dropped next to the installed payload.
#[derive(Debug, Serialize)]
struct StoreMeta<'a> {
    tool: String,
    version: &'a str,
    architecture: &'a str,
    installed_at: String,
    store_path: String,
    binary: &'a str,
    binary_path: String,
    files: String,
}

/// The versioned on-disk store:
/// `STORE_ROOT/<owner>/<repo>/<sanitized_version>/{bin,lib,share,...}` with
/// a sibling `current` symlink pointing at the active version.
pub struct Store {
    root: PathBuf,
    bin_dir: PathBuf,
    tmp_dir: PathBuf,
    arch: &'static str,
}

impl Store {
    pub fn new(config: &Config) -> Store {
        Store {
            root: config.store_root.clone(),
            bin_dir: config.bin_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            arch: config.arch.as_str(),
        }
    }

    pub fn tool_dir(&self, id: &ToolId) -> PathBuf {
        self.root.join(&id.owner).join(&id.repo)
    }

    pub fn version_dir(&self, id: &ToolId, version: &str) -> PathBuf {
        self.tool_dir(id).join(version::sanitize(version))
    }

    pub fn current_link(&self, id: &ToolId) -> PathBuf {
        self.tool_dir(id).join("current")
    }

    /// Extracts `archive` and populates the version directory: the
    /// principal binary lands in `bin/`, auxiliary top-level directories are
    /// copied best-effort, and `manifest.json` summarizes the install.
    /// Returns the binary's store path and basename.
    pub fn install_to_store(
        &self,
        tx: &mut Transaction,
        id: &ToolId,
        version: &str,
        archive: &Path,
        expected_binary: Option<&str>,
    ) -> Result<(PathBuf, String)> {
        let vdir = self.version_dir(id, version);
        if vdir.exists() {
            tx.record_remove(&vdir)?;
            fs::remove_dir_all(&vdir).map_err(|e| TpmError::fs(&vdir, e))?;
        }
        tx.record_mkdir(&vdir)?;

        let staging = tempfile::Builder::new()
            .prefix("tpm-extract-")
            .tempdir_in(&self.tmp_dir)
            .map_err(|e| TpmError::fs(&self.tmp_dir, e))?;
        extract::extract_archive(archive, staging.path())?;

        let found = extract::locate_binary(staging.path(), expected_binary)?;
        let binary_name = found
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TpmError::Internal("binary candidate has no file name".to_string()))?;

        let bin_dir = vdir.join("bin");
        fs::create_dir_all(&bin_dir).map_err(|e| TpmError::fs(&bin_dir, e))?;
        let bin_path = bin_dir.join(&binary_name);
        transaction::rename_or_copy(&found, &bin_path).map_err(|e| TpmError::fs(&bin_path, e))?;
        let mut perms = fs::metadata(&bin_path)
            .map_err(|e| TpmError::fs(&bin_path, e))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&bin_path, perms).map_err(|e| TpmError::fs(&bin_path, e))?;

        // Auxiliary trees (lib/, share/, completions, ...) ride along; a
        // failed copy there degrades the install but does not abort it.
        for entry in fs::read_dir(staging.path()).map_err(|e| TpmError::fs(staging.path(), e))? {
            let entry = entry.map_err(|e| TpmError::fs(staging.path(), e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dest = vdir.join(entry.file_name());
            if let Err(e) = transaction::copy_recursive(&path, &dest) {
                eprintln!(
                    "warning: could not copy {} into the store: {e}",
                    path.display()
                );
            }
        }

        self.write_meta(id, version, &vdir, &binary_name, &bin_path)?;
        verbose!(1, "installed {} {} into {}", id, version, vdir.display());
        Ok((bin_path, binary_name))
    }

    fn write_meta(
        &self,
        id: &ToolId,
        version: &str,
        vdir: &Path,
        binary: &str,
        bin_path: &Path,
    ) -> Result<()> {
        let files = WalkDir::new(vdir)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(vdir)
                    .ok()
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect::<Vec<_>>()
            .join(",");
        let meta = StoreMeta {
            tool: id.to_string(),
            version,
            architecture: self.arch,
            installed_at: chrono::Utc::now().to_rfc3339(),
            store_path: vdir.to_string_lossy().to_string(),
            binary,
            binary_path: bin_path.to_string_lossy().to_string(),
            files,
        };
        let meta_path = vdir.join(STORE_META_FILE);
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| TpmError::Internal(format!("could not serialize store metadata: {e}")))?;
        fs::write(&meta_path, json).map_err(|e| TpmError::fs(&meta_path, e))?;
        Ok(())
    }

    /// Publishes `BIN_DIR/<name>` as a symlink to `store_bin_path`. A link
    /// already pointing at the same target is left alone; anything else in
    /// the way is recorded with the transaction and replaced.
    pub fn create_symlink(
        &self,
        tx: &mut Transaction,
        store_bin_path: &Path,
        name: &str,
    ) -> Result<PathBuf> {
        let link = self.bin_dir.join(name);
        if let Ok(meta) = link.symlink_metadata() {
            if meta.file_type().is_symlink()
                && crate::manifest::symlink_resolves_to(&link, store_bin_path)
            {
                verbose!(1, "symlink {} already up to date", link.display());
                return Ok(link);
            }
        }
        tx.record_symlink(store_bin_path, &link)?;
        transaction::remove_any(&link).map_err(|e| TpmError::fs(&link, e))?;
        fs::create_dir_all(&self.bin_dir).map_err(|e| TpmError::fs(&self.bin_dir, e))?;
        std::os::unix::fs::symlink(store_bin_path, &link).map_err(|e| TpmError::fs(&link, e))?;
        Ok(link)
    }

    /// Version directory names present for a tool, sorted oldest to newest
    /// by normalized comparison.
    pub fn installed_versions(&self, id: &ToolId) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.tool_dir(id)) else {
            return Vec::new();
        };
        let mut versions: Vec<String> = entries
            .flatten()
            .filter(|e| {
                // symlink_metadata keeps `current` (a symlink) out.
                e.path()
                    .symlink_metadata()
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
            })
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != "current")
            .collect();
        versions.sort_by(|a, b| version::compare(a, b));
        versions
    }

    /// The version the `current` symlink points at, if it is sane.
    pub fn current_version(&self, id: &ToolId) -> Option<String> {
        let target = fs::read_link(self.current_link(id)).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    /// Atomically repoints `current` at an existing version directory.
    pub fn set_current(&self, tx: &mut Transaction, id: &ToolId, version: &str) -> Result<()> {
        let sanitized = version::sanitize(version);
        let vdir = self.tool_dir(id).join(&sanitized);
        if !vdir.is_dir() {
            return Err(TpmError::NotFound(format!(
                "version directory {} does not exist",
                vdir.display()
            )));
        }
        let link = self.current_link(id);
        tx.record_symlink(&vdir, &link)?;
        // Build the new link aside, then rename over the old one.
        let staging = self
            .tool_dir(id)
            .join(format!(".current-{}", std::process::id()));
        let _ = fs::remove_file(&staging);
        std::os::unix::fs::symlink(&sanitized, &staging).map_err(|e| TpmError::fs(&staging, e))?;
        fs::rename(&staging, &link).map_err(|e| TpmError::fs(&link, e))?;
        Ok(())
    }

    /// Deletes oldest version directories until `keep` remain. The current
    /// version is skipped during the walk; the removal budget is fixed up
    /// front.
    pub fn cleanup_old_versions(&self, id: &ToolId, keep: usize) -> Result<Vec<String>> {
        let versions = self.installed_versions(id);
        if versions.len() <= keep {
            return Ok(Vec::new());
        }
        let current = self.current_version(id);
        let mut budget = versions.len() - keep;
        let mut removed = Vec::new();
        for v in versions {
            if budget == 0 {
                break;
            }
            if Some(&v) == current.as_ref() {
                continue;
            }
            let dir = self.tool_dir(id).join(&v);
            fs::remove_dir_all(&dir).map_err(|e| TpmError::fs(&dir, e))?;
            verbose!(1, "pruned {} {}", id, v);
            removed.push(v);
            budget -= 1;
        }
        Ok(removed)
    }

    /// Removes every trace of a tool from the store: version directories,
    /// the `current` link and the tool directory itself.
    pub fn remove_tool(&self, tx: &mut Transaction, id: &ToolId) -> Result<()> {
        let dir = self.tool_dir(id);
        if dir.exists() {
            tx.record_remove(&dir)?;
            fs::remove_dir_all(&dir).map_err(|e| TpmError::fs(&dir, e))?;
        }
        // Drop the owner directory too once it is empty.
        if let Some(owner_dir) = dir.parent() {
            if fs::read_dir(owner_dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
                let _ = fs::remove_dir(owner_dir);
            }
        }
        Ok(())
    }

    /// Walks the store tree and reports broken `current` links and version
    /// directories without a populated `bin/`.
    pub fn validate_store(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let Ok(owners) = fs::read_dir(&self.root) else {
            return errors;
        };
        for owner in owners.flatten().filter(|e| e.path().is_dir()) {
            let Ok(repos) = fs::read_dir(owner.path()) else {
                continue;
            };
            for repo in repos.flatten().filter(|e| e.path().is_dir()) {
                let tool_dir = repo.path();
                let current = tool_dir.join("current");
                if current.symlink_metadata().is_ok() && fs::canonicalize(&current).is_err() {
                    errors.push(format!("broken current symlink: {}", current.display()));
                }
                let Ok(versions) = fs::read_dir(&tool_dir) else {
                    continue;
                };
                for vdir in versions.flatten() {
                    let path = vdir.path();
                    let is_link = path
                        .symlink_metadata()
                        .map(|m| m.file_type().is_symlink())
                        .unwrap_or(true);
                    if is_link || !path.is_dir() {
                        continue;
                    }
                    let bin = path.join("bin");
                    let populated = fs::read_dir(&bin)
                        .map(|mut d| d.next().is_some())
                        .unwrap_or(false);
                    if !populated {
                        errors.push(format!(
                            "version directory without binaries: {}",
                            path.display()
                        ));
                    }
                }
            }
        }
        errors
    }
}
