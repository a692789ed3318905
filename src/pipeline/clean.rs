//! Removal of generated artifacts and fetched checkouts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::HarnessConfig;
use crate::error::HarnessError;

pub struct WorkspaceCleaner<'a> {
    config: &'a HarnessConfig,
}

impl<'a> WorkspaceCleaner<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self { config }
    }

    /// Every path `clean` is responsible for, files first.
    pub fn targets(&self) -> Vec<PathBuf> {
        let workspace = &self.config.workspace;
        let job = &self.config.firmware.job;
        let mut targets = vec![
            workspace.join(&job.output),
            workspace.join(job.staging_output()),
            workspace.join(&self.config.runtime.capture_log),
        ];
        targets.extend(
            self.config
                .dependencies
                .iter()
                .chain(std::iter::once(&self.config.base_image.source))
                .map(|dep| dep.local_path(workspace)),
        );
        targets
    }

    /// Remove whatever exists among [`WorkspaceCleaner::targets`].
    ///
    /// Missing targets are skipped, so running this twice is harmless. Not
    /// safe while a `run` session is using the workspace.
    pub fn clean(&self) -> Result<Vec<PathBuf>, HarnessError> {
        let mut removed = Vec::new();
        for target in self.targets() {
            if remove_path(&target)? {
                info!(path = %target.display(), "removed");
                removed.push(target);
            }
        }
        Ok(removed)
    }
}

fn remove_path(path: &Path) -> Result<bool, HarnessError> {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return Ok(false);
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| HarnessError::io(format!("removing '{}'", path.display()), e))?;
    Ok(true)
}
