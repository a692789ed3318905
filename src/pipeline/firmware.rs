//! Cross-compilation of the firmware image inside the build container.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::executor::{ContainerExecutor, ExecFlags};
use crate::process::shell_quote;

/// One compiler invocation producing the firmware ELF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub compiler: String,
    /// `-march=` value.
    pub arch: String,
    /// `-mabi=` value.
    pub abi: String,
    /// Optimisation, debug and freestanding flags.
    pub cflags: Vec<String>,
    pub include_dirs: Vec<PathBuf>,
    pub linker_script: PathBuf,
    pub ldflags: Vec<String>,
    /// Compiled and linked in this order.
    pub sources: Vec<PathBuf>,
    /// Workspace-relative output file.
    pub output: PathBuf,
}

impl CompileJob {
    /// Argument vector writing to `output`.
    pub fn argv(&self, output: &Path) -> Vec<String> {
        let mut argv = vec![
            self.compiler.clone(),
            format!("-march={}", self.arch),
            format!("-mabi={}", self.abi),
        ];
        argv.extend(self.cflags.iter().cloned());
        argv.extend(
            self.include_dirs
                .iter()
                .map(|dir| format!("-I{}", dir.display())),
        );
        argv.push("-T".to_string());
        argv.push(self.linker_script.display().to_string());
        argv.extend(self.ldflags.iter().cloned());
        argv.push("-o".to_string());
        argv.push(output.display().to_string());
        argv.extend(self.sources.iter().map(|src| src.display().to_string()));
        argv
    }

    /// Shell command line writing to `output`.
    pub fn command_line(&self, output: &Path) -> String {
        self.argv(output)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Where the compiler writes before the result is published.
    pub fn staging_output(&self) -> PathBuf {
        let name = self
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firmware".to_string());
        self.output.with_file_name(format!(".{name}.partial"))
    }
}

pub struct FirmwareCompiler<'a> {
    workspace: &'a Path,
    executor: &'a ContainerExecutor<'a>,
}

impl<'a> FirmwareCompiler<'a> {
    pub fn new(workspace: &'a Path, executor: &'a ContainerExecutor<'a>) -> Self {
        Self {
            workspace,
            executor,
        }
    }

    /// Compile `job`, returning the absolute path of the published artifact.
    ///
    /// The compiler writes a staging file that is renamed over the output
    /// only on success, so a failed compile leaves any existing artifact
    /// untouched and never creates a new one.
    pub fn compile(&self, job: &CompileJob) -> Result<PathBuf, HarnessError> {
        let output_name = job.output.display().to_string();
        let failed = |source: HarnessError| HarnessError::CompileFailed {
            output: output_name.clone(),
            source: Box::new(source),
        };

        for dir in &job.include_dirs {
            if !self.workspace.join(dir).is_dir() {
                return Err(failed(HarnessError::Precondition(format!(
                    "include directory '{}' is missing; run fetch-dependencies first",
                    dir.display()
                ))));
            }
        }

        let staging = job.staging_output();
        let staging_path = self.workspace.join(&staging);
        let output_path = self.workspace.join(&job.output);
        remove_if_exists(&staging_path).map_err(&failed)?;

        info!(output = %output_name, "compiling firmware");
        let command = job.command_line(&staging);
        if let Err(e) = self.executor.execute(&command, ExecFlags::default()) {
            if let Err(cleanup) = remove_if_exists(&staging_path) {
                warn!("leaving partial firmware behind: {cleanup}");
            }
            return Err(failed(e));
        }

        if !staging_path.is_file() {
            return Err(failed(HarnessError::Precondition(format!(
                "compiler reported success but produced no '{}'",
                staging.display()
            ))));
        }
        fs::rename(&staging_path, &output_path).map_err(|e| {
            failed(HarnessError::io(
                format!(
                    "publishing '{}' as '{}'",
                    staging_path.display(),
                    output_path.display()
                ),
                e,
            ))
        })?;
        debug!(path = %output_path.display(), "firmware published");
        Ok(output_path)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), HarnessError> {
    if path.exists() {
        fs::remove_file(path)
            .map_err(|e| HarnessError::io(format!("removing '{}'", path.display()), e))?;
    }
    Ok(())
}
