use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use verbosio::verbose;

use crate::error::{Result, TpmError};

/// Backup directories from finished transactions are swept once they are
/// older than this.
const BACKUP_MAX_AGE: Duration = Duration::from_secs(3600);

type Undo = Box<dyn FnOnce() -> io::Result<()>>;

struct Step {
    desc: String,
    undo: Undo,
}

/// Records a compensating action for every filesystem mutation made during
/// an install/update/remove. On failure the actions run in LIFO order and
/// restore the pre-transaction state; on commit they are discarded.
///
/// Backups taken for restores live in a directory scoped to this
/// transaction, so the janitor sweep can never remove rollback data that is
/// still live.
pub struct Transaction {
    active: bool,
    kind: String,
    context: String,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    steps: Vec<Step>,
    backup_root: PathBuf,
    backup_dir: Option<PathBuf>,
    backup_seq: u64,
}

impl Transaction {
    pub fn new(backup_root: impl Into<PathBuf>) -> Transaction {
        Transaction {
            active: false,
            kind: String::new(),
            context: String::new(),
            start_time: None,
            steps: Vec::new(),
            backup_root: backup_root.into(),
            backup_dir: None,
            backup_seq: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Starts a transaction. At most one may be active per process.
    pub fn begin(&mut self, kind: &str, context: &str) -> Result<()> {
        if self.active {
            return Err(TpmError::Internal(format!(
                "transaction {}/{} is already active",
                self.kind, self.context
            )));
        }
        self.active = true;
        self.kind = kind.to_string();
        self.context = context.to_string();
        self.start_time = Some(chrono::Utc::now());
        self.steps.clear();
        self.backup_dir = None;
        self.backup_seq = 0;
        verbose!(1, "transaction {}/{} started", kind, context);
        Ok(())
    }

    /// Appends a compensating action. Outside a transaction this logs and
    /// returns without effect.
    pub fn record(&mut self, desc: &str, undo: impl FnOnce() -> io::Result<()> + 'static) {
        if !self.active {
            eprintln!("warning: no active transaction, not recording: {desc}");
            return;
        }
        self.steps.push(Step {
            desc: desc.to_string(),
            undo: Box::new(undo),
        });
    }

    /// Discards all recorded actions and sweeps stale backup directories
    /// left behind by earlier runs.
    pub fn commit(&mut self) -> Result<()> {
        if !self.active {
            return Err(TpmError::Internal("commit without active transaction".to_string()));
        }
        let elapsed_ms = self
            .start_time
            .map(|t| (chrono::Utc::now() - t).num_milliseconds())
            .unwrap_or(0);
        verbose!(1, "transaction {}/{} committed ({} step(s), {}ms)",
            self.kind, self.context, self.steps.len(), elapsed_ms);
        let own_backup = self.backup_dir.take();
        self.clear();
        if let Some(dir) = own_backup {
            let _ = fs::remove_dir_all(dir);
        }
        self.sweep_stale_backups();
        Ok(())
    }

    /// Executes all recorded actions in LIFO order. Individual failures are
    /// logged and never stop the remaining steps; the count of failed steps
    /// is returned. State is cleared regardless.
    pub fn rollback(&mut self) -> usize {
        if !self.active {
            return 0;
        }
        let steps = std::mem::take(&mut self.steps);
        let total = steps.len();
        let mut failed = 0;
        for step in steps.into_iter().rev() {
            if let Err(e) = (step.undo)() {
                eprintln!("warning: rollback step failed ({}): {e}", step.desc);
                failed += 1;
            }
        }
        eprintln!(
            "rolled back {}/{} ({} of {} step(s) failed)",
            self.kind, self.context, failed, total
        );
        self.backup_dir = None;
        self.clear();
        failed
    }

    fn clear(&mut self) {
        self.active = false;
        self.kind.clear();
        self.context.clear();
        self.start_time = None;
        self.steps.clear();
        self.backup_seq = 0;
    }

    /// If `path` exists, stashes a copy in the backup directory and records
    /// an action that restores it. The caller performs the actual removal.
    pub fn record_remove(&mut self, path: &Path) -> Result<()> {
        if path.symlink_metadata().is_err() {
            return Ok(());
        }
        let backup = self.stash(path)?;
        let original = path.to_path_buf();
        self.record(&format!("restore {}", original.display()), move || {
            restore(&backup, &original)
        });
        Ok(())
    }

    /// Captures whatever currently sits at `link` (symlink, regular file or
    /// directory, or nothing) so rollback can restore it exactly. The caller
    /// replaces the link afterwards.
    pub fn record_symlink(&mut self, _target: &Path, link: &Path) -> Result<()> {
        let meta = link.symlink_metadata();
        match meta {
            Ok(m) if m.file_type().is_symlink() => {
                let old_target = fs::read_link(link).map_err(|e| TpmError::fs(link, e))?;
                let link = link.to_path_buf();
                self.record(&format!("restore symlink {}", link.display()), move || {
                    remove_any(&link)?;
                    std::os::unix::fs::symlink(&old_target, &link)
                });
            }
            Ok(_) => {
                let backup = self.stash(link)?;
                let link = link.to_path_buf();
                self.record(&format!("restore {}", link.display()), move || {
                    restore(&backup, &link)
                });
            }
            Err(_) => {
                let link = link.to_path_buf();
                self.record(&format!("remove {}", link.display()), move || {
                    remove_any(&link)
                });
            }
        }
        Ok(())
    }

    /// Creates `path` (and parents) and records removal for the directories
    /// that did not pre-exist.
    pub fn record_mkdir(&mut self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        // Find the first missing ancestor so rollback removes the whole
        // subtree we created, not just the leaf.
        let mut created_root = path.to_path_buf();
        while let Some(parent) = created_root.parent() {
            if parent.exists() || parent == Path::new("") {
                break;
            }
            created_root = parent.to_path_buf();
        }
        fs::create_dir_all(path).map_err(|e| TpmError::fs(path, e))?;
        self.record(&format!("rmdir {}", created_root.display()), move || {
            remove_any(&created_root)
        });
        Ok(())
    }

    /// Moves `src` to `dst`, backing up any pre-existing destination. The
    /// compensating action moves `dst` back to `src` and restores the old
    /// destination from backup.
    pub fn safe_move(&mut self, src: &Path, dst: &Path) -> Result<()> {
        if dst.symlink_metadata().is_ok() {
            let backup = self.stash(dst)?;
            let dst_owned = dst.to_path_buf();
            self.record(&format!("restore {}", dst_owned.display()), move || {
                restore(&backup, &dst_owned)
            });
            remove_any(dst).map_err(|e| TpmError::fs(dst, e))?;
        }
        rename_or_copy(src, dst).map_err(|e| TpmError::fs(dst, e))?;
        let src_owned = src.to_path_buf();
        let dst_owned = dst.to_path_buf();
        self.record(&format!("unmove {}", dst_owned.display()), move || {
            if dst_owned.symlink_metadata().is_ok() {
                rename_or_copy(&dst_owned, &src_owned)?;
            }
            Ok(())
        });
        Ok(())
    }

    /// Copies `src` to `dst`, backing up any pre-existing destination. The
    /// compensating action removes the copy and restores the old
    /// destination.
    pub fn safe_copy(&mut self, src: &Path, dst: &Path) -> Result<()> {
        if dst.symlink_metadata().is_ok() {
            let backup = self.stash(dst)?;
            let dst_owned = dst.to_path_buf();
            self.record(&format!("restore {}", dst_owned.display()), move || {
                restore(&backup, &dst_owned)
            });
            remove_any(dst).map_err(|e| TpmError::fs(dst, e))?;
        } else {
            let dst_owned = dst.to_path_buf();
            self.record(&format!("remove {}", dst_owned.display()), move || {
                remove_any(&dst_owned)
            });
        }
        copy_recursive(src, dst).map_err(|e| TpmError::fs(dst, e))?;
        Ok(())
    }

    /// Copies `path` into this transaction's backup directory and returns
    /// the backup location.
    fn stash(&mut self, path: &Path) -> Result<PathBuf> {
        let dir = self.ensure_backup_dir()?;
        self.backup_seq += 1;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let backup = dir.join(format!("{:04}_{}", self.backup_seq, name));
        copy_recursive(path, &backup).map_err(|e| TpmError::fs(path, e))?;
        Ok(backup)
    }

    fn ensure_backup_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.backup_dir {
            return Ok(dir.clone());
        }
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let dir = self
            .backup_root
            .join(format!("{}-{}", stamp, std::process::id()));
        fs::create_dir_all(&dir).map_err(|e| TpmError::fs(&dir, e))?;
        self.backup_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Removes backup directories of *other* transactions that are older
    /// than an hour. The live transaction's own directory is never touched.
    fn sweep_stale_backups(&self) {
        let Ok(entries) = fs::read_dir(&self.backup_root) else {
            return;
        };
        let cutoff = SystemTime::now() - BACKUP_MAX_AGE;
        for entry in entries.flatten() {
            let path = entry.path();
            if Some(&path) == self.backup_dir.as_ref() {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| t < cutoff)
                .unwrap_or(false);
            if old {
                verbose!(1, "sweeping stale backup {}", path.display());
                let _ = fs::remove_dir_all(&path);
            }
        }
    }
}

/// Removes a path whatever it is; absent paths are fine.
pub(crate) fn remove_any(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Puts a backup copy back at its original location, replacing anything
/// that has appeared there since.
fn restore(backup: &Path, original: &Path) -> io::Result<()> {
    if backup.symlink_metadata().is_err() {
        // Already consumed by an earlier replay; restores are idempotent.
        return Ok(());
    }
    remove_any(original)?;
    if let Some(parent) = original.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_recursive(backup, original)
}

pub(crate) fn rename_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            copy_recursive(src, dst)?;
            remove_any(src)
        }
        Err(e) => Err(e),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(18))
}

/// Recursive copy that preserves symlinks and permissions.
pub(crate) fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = src.symlink_metadata()?;
    let ftype = meta.file_type();
    if ftype.is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else if ftype.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
    }
    Ok(())
}
