//! Foreground emulator run and session teardown.

use std::fs;
use std::io::Write;

use tracing::{info, warn};

use super::capture::CaptureHandle;
use super::RuntimeSettings;
use crate::error::{HarnessError, INTERNAL_FAILURE_EXIT_CODE};
use crate::executor::session::ExecutionSession;

/// Outcome of one supervised emulator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    /// Full capture log contents.
    pub log: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// [`HarnessError::EmulatorNonZeroExit`] for a failed run.
    pub fn failure(&self) -> Option<HarnessError> {
        (!self.success()).then_some(HarnessError::EmulatorNonZeroExit {
            code: self.exit_code,
        })
    }
}

pub struct EmulatorSupervisor<'s> {
    settings: &'s RuntimeSettings,
}

impl<'s> EmulatorSupervisor<'s> {
    pub fn new(settings: &'s RuntimeSettings) -> Self {
        Self { settings }
    }

    /// Run the emulator in the foreground, then tear the session down.
    ///
    /// The emulator's exit status never short-circuits teardown: the
    /// session is stopped, the capture joined and the full log written to
    /// `out` whether the emulator succeeded, failed, or could not start.
    pub fn supervise(
        &self,
        session: &mut ExecutionSession<'_>,
        capture: CaptureHandle,
        out: &mut dyn Write,
    ) -> Result<RunResult, HarnessError> {
        let emulator = self.run_foreground(session);
        match &emulator {
            Ok(code) => info!(code, "emulator exited; stopping background tasks"),
            Err(e) => warn!("emulator did not run: {e}"),
        }

        if let Err(e) = session.stop() {
            warn!("stopping session failed: {e}");
        }
        let log_path = capture.log_path().to_path_buf();
        match capture.finish(self.settings.capture_grace) {
            Ok(summary) => info!(lines = summary.lines, "capture finished"),
            Err(e) => warn!("capture did not finish cleanly: {e}"),
        }

        let log = fs::read(&log_path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|e| {
                warn!(log = %log_path.display(), "capture log unreadable: {e}");
                String::new()
            });
        dump_log(out, &log_path.display().to_string(), &log)?;

        Ok(RunResult {
            exit_code: emulator?,
            log,
        })
    }

    fn run_foreground(&self, session: &ExecutionSession<'_>) -> Result<i32, HarnessError> {
        info!("starting emulator: {}", self.settings.emulator_command.join(" "));
        let cmd = session
            .foreground(&self.settings.emulator_command)
            .allow_fail();
        let outcome = session.run(&cmd)?;
        Ok(outcome.code.unwrap_or_else(|| {
            warn!("emulator terminated by signal");
            INTERNAL_FAILURE_EXIT_CODE
        }))
    }
}

fn dump_log(out: &mut dyn Write, label: &str, log: &str) -> Result<(), HarnessError> {
    let write = |out: &mut dyn Write| -> std::io::Result<()> {
        writeln!(out, "Dumping capture log ({label}):")?;
        out.write_all(log.as_bytes())?;
        if !log.is_empty() && !log.ends_with('\n') {
            writeln!(out)?;
        }
        out.flush()
    };
    write(out).map_err(|e| HarnessError::io("writing capture log to output", e))
}
