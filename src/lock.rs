//! Exclusive workspace lock.
//!
//! Two harness invocations against one workspace would race on the
//! dependency checkouts, the firmware artifact and the capture log. Every
//! command runs under this lock.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;

pub const LOCK_FILENAME: &str = "lock";

/// Held for the lifetime of one invocation; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Take the lock under `state_dir`, failing immediately if another
    /// process holds it.
    ///
    /// The lock file is never unlinked: removing a file another process
    /// has open would let a third process lock a fresh inode at the same
    /// path.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory '{}'", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(anyhow!(
                "workspace is locked by another ecu-harness process: {}",
                path.display()
            ));
        }
        debug!(path = %path.display(), "workspace lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
