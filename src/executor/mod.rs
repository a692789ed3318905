//! Container execution.
//!
//! [`ContainerExecutor`] runs one-shot commands in a throwaway container with
//! the workspace mounted read-write. [`session::ExecutionSession`] keeps a
//! container alive so several structured steps can share its network
//! namespace.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ecu_harness::executor::{ContainerExecutor, ExecFlags};
//!
//! let executor = ContainerExecutor::new(&config, &config.image.tag, &HostRunner);
//! executor.execute("riscv-none-elf-gcc --version", ExecFlags::default())?;
//! ```

pub mod session;

use std::path::Path;

use tracing::info;

use crate::config::{ContainerSettings, HarnessConfig};
use crate::error::HarnessError;
use crate::process::{Cmd, CommandRunner, ProcessOutcome};

/// Optional container flags. `--rm` is always applied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecFlags {
    /// Keep stdin open (`-i`).
    pub interactive: bool,
    /// Full device and capability access (`--privileged`).
    pub privileged: bool,
    /// Allocate a pseudo-terminal (`-t`).
    pub pty: bool,
}

pub struct ContainerExecutor<'a> {
    container: &'a ContainerSettings,
    workspace: &'a Path,
    image: &'a str,
    runner: &'a dyn CommandRunner,
}

impl<'a> ContainerExecutor<'a> {
    pub fn new(config: &'a HarnessConfig, image: &'a str, runner: &'a dyn CommandRunner) -> Self {
        Self {
            container: &config.container,
            workspace: &config.workspace,
            image,
            runner,
        }
    }

    pub fn engine(&self) -> &str {
        &self.container.engine
    }

    pub fn image(&self) -> &str {
        self.image
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    /// `-v <workspace>:<mount> -w <mount>`
    pub(crate) fn mount_args(&self) -> [String; 4] {
        [
            "-v".to_string(),
            format!(
                "{}:{}",
                self.workspace.display(),
                self.container.mount_point
            ),
            "-w".to_string(),
            self.container.mount_point.clone(),
        ]
    }

    /// The full engine invocation for `command` run through the shell.
    pub fn command_for(&self, command: &str, flags: ExecFlags) -> Cmd {
        let mut cmd = Cmd::new(self.container.engine.as_str()).args(["run", "--rm"]);
        if flags.interactive {
            cmd = cmd.arg("-i");
        }
        if flags.privileged {
            cmd = cmd.arg("--privileged");
        }
        if flags.pty {
            cmd = cmd.arg("-t");
        }
        cmd.args(self.mount_args())
            .arg(self.image)
            .arg(self.container.shell.as_str())
            .arg("-c")
            .arg(command)
            .current_dir(self.workspace)
    }

    /// Run `command` in a fresh container and block until it exits.
    ///
    /// A non-zero exit is returned as [`HarnessError::CommandFailed`]; there
    /// are no retries.
    pub fn execute(&self, command: &str, flags: ExecFlags) -> Result<ProcessOutcome, HarnessError> {
        info!(image = self.image, "running in container: {command}");
        self.runner.run(&self.command_for(command, flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;
    use std::path::PathBuf;

    fn config() -> HarnessConfig {
        HarnessConfig::defaults(&PathBuf::from("/work/ecu"))
    }

    #[test]
    fn plain_execution_only_adds_rm_and_mount() {
        let config = config();
        let runner = FakeRunner::new();
        ContainerExecutor::new(&config, "riscv-ecu-renode", &runner)
            .execute("make", ExecFlags::default())
            .unwrap();

        assert_eq!(
            runner.commands(),
            ["docker run --rm -v /work/ecu:/app -w /app riscv-ecu-renode bash -c make"]
        );
    }

    #[test]
    fn flags_are_added_conditionally() {
        let config = config();
        let runner = FakeRunner::new();
        let flags = ExecFlags {
            interactive: true,
            privileged: true,
            pty: true,
        };
        let cmd = ContainerExecutor::new(&config, "img", &runner).command_for("true", flags);
        let args = cmd.get_args();

        assert_eq!(&args[..5], ["run", "--rm", "-i", "--privileged", "-t"]);
    }

    #[test]
    fn nonzero_exit_is_command_failed() {
        let config = config();
        let runner = FakeRunner::new().exit_with("bash -c", 2);
        let err = ContainerExecutor::new(&config, "img", &runner)
            .execute("false", ExecFlags::default())
            .unwrap_err();

        assert!(matches!(
            err,
            HarnessError::CommandFailed {
                exit_code: Some(2),
                ..
            }
        ));
    }
}
