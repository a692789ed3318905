//! Runtime environment: link bring-up, traffic capture and emulator run.
//!
//! One `run` is one privileged session container. Inside it, in order:
//!
//! 1. [`link::LinkBootstrapper`] brings the virtual CAN interface up.
//! 2. [`capture::CaptureHandle`] starts sniffing the bus into the capture log.
//! 3. [`emulator::EmulatorSupervisor`] runs the emulator in the foreground,
//!    then stops the session, joins the capture and dumps the log.

pub mod capture;
pub mod emulator;
pub mod link;

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::executor::session::ExecutionSession;
use crate::executor::{ContainerExecutor, ExecFlags};

use capture::CaptureHandle;
use emulator::{EmulatorSupervisor, RunResult};
use link::LinkBootstrapper;

/// Whether the emulator exec gets a pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyMode {
    /// Only when both stdin and stdout are terminals.
    Auto,
    Always,
    Never,
}

impl PtyMode {
    pub fn resolve(self) -> bool {
        match self {
            PtyMode::Auto => std::io::stdin().is_terminal() && std::io::stdout().is_terminal(),
            PtyMode::Always => true,
            PtyMode::Never => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub interface: String,
    /// Kernel module loaded when direct interface creation fails.
    pub kernel_module: String,
    /// Prefix link mutations with `sudo` inside the container.
    pub use_sudo: bool,
    pub capture_command: Vec<String>,
    /// Workspace-relative capture log, truncated at every run.
    pub capture_log: PathBuf,
    pub emulator_command: Vec<String>,
    /// Mirror captured frames to stdout while running.
    pub echo_capture: bool,
    /// How long the capture may take to exit after the session stops.
    pub capture_grace: Duration,
    pub pty: PtyMode,
}

pub struct RuntimeBootstrapper<'a> {
    config: &'a HarnessConfig,
    executor: &'a ContainerExecutor<'a>,
}

impl<'a> RuntimeBootstrapper<'a> {
    pub fn new(config: &'a HarnessConfig, executor: &'a ContainerExecutor<'a>) -> Self {
        Self { config, executor }
    }

    /// Start session `session_name`, bring the link up, start the capture
    /// and hand over to the emulator supervisor.
    ///
    /// A link failure aborts the run; the session is removed on every path.
    pub fn run(
        &self,
        session_name: &str,
        out: &mut dyn Write,
    ) -> Result<RunResult, HarnessError> {
        let settings = &self.config.runtime;
        let flags = ExecFlags {
            interactive: true,
            privileged: true,
            pty: settings.pty.resolve(),
        };
        let mut session = ExecutionSession::start(self.executor, session_name, flags)?;

        let link = LinkBootstrapper::new(&session, settings).establish()?;
        info!(interface = %settings.interface, steps = ?link.steps, "link is up");

        let capture = CaptureHandle::start(
            &session,
            &settings.capture_command,
            &self.config.capture_log_path(),
            settings.echo_capture,
        )?;

        EmulatorSupervisor::new(settings).supervise(&mut session, capture, out)
    }
}
