use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::{Result, TpmError};

/// Exclusive cross-process lock backed by a directory under
/// `TMP_DIR/locks/`. Directory creation is atomic, so two invocations
/// racing for the same scope cannot both win; the loser fails fast with
/// `Busy`. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct OpLock {
    path: PathBuf,
}

impl OpLock {
    /// Takes the lock for `scope` (a tool id for mutations, `manifest` for
    /// global passes).
    pub fn acquire(locks_dir: PathBuf, scope: &str) -> Result<OpLock> {
        fs::create_dir_all(&locks_dir).map_err(|e| TpmError::fs(&locks_dir, e))?;
        let sanitized: String = scope
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = locks_dir.join(format!("{sanitized}.lock"));
        match fs::create_dir(&path) {
            Ok(()) => {
                // Pid file for post-mortem debugging of stale locks.
                let _ = fs::write(path.join("pid"), std::process::id().to_string());
                Ok(OpLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(TpmError::Busy(format!(
                "{scope} (remove {} if no other tpm is running)",
                path.display()
            ))),
            Err(e) => Err(TpmError::fs(&path, e)),
        }
    }
}

impl Drop for OpLock {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let held = OpLock::acquire(dir.path().to_path_buf(), "example/hello").unwrap();
        let err = OpLock::acquire(dir.path().to_path_buf(), "example/hello").unwrap_err();
        assert!(matches!(err, TpmError::Busy(_)));
        drop(held);
        OpLock::acquire(dir.path().to_path_buf(), "example/hello").unwrap();
    }

    #[test]
    fn scopes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let _a = OpLock::acquire(dir.path().to_path_buf(), "a/tool").unwrap();
        let _b = OpLock::acquire(dir.path().to_path_buf(), "b/tool").unwrap();
    }
}
