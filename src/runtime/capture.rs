//! Background bus-traffic capture.
//!
//! The capture process runs inside the session with its stdout piped back
//! to a writer thread that appends every line to the capture log. The
//! writer is joined at teardown so the log is complete and flushed before
//! anyone reads it.
//!
//! Console echo is a separate thread fed over a channel. The writer never
//! touches stdout, so a caller holding the stdout lock cannot stall the log;
//! at teardown the echo gets the grace period to drain and is otherwise
//! left behind.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::executor::session::ExecutionSession;
use crate::process::ProcessControl;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of joining a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub lines: u64,
    /// The capture process had to be killed after the grace period.
    pub killed: bool,
}

pub struct CaptureHandle {
    log_path: PathBuf,
    control: Option<Box<dyn ProcessControl>>,
    writer: Option<JoinHandle<io::Result<u64>>>,
    /// Signalled once the echo thread has printed everything.
    echo_drained: Option<Receiver<()>>,
}

impl CaptureHandle {
    /// Truncate `log_path` and start `argv` in `session` without waiting.
    pub fn start(
        session: &ExecutionSession<'_>,
        argv: &[String],
        log_path: &Path,
        echo: bool,
    ) -> Result<Self, HarnessError> {
        let log = File::create(log_path).map_err(|e| {
            HarnessError::io(format!("truncating capture log '{}'", log_path.display()), e)
        })?;

        info!(log = %log_path.display(), "starting capture: {}", argv.join(" "));
        let (echo_tx, echo_drained) = if echo {
            let (tx, drained) = start_echo()?;
            (Some(tx), Some(drained))
        } else {
            (None, None)
        };

        let spawned = session.spawn(&session.step(argv))?;
        let mut control = spawned.control;
        let stdout = spawned.stdout;
        let writer = thread::Builder::new()
            .name("capture-writer".to_string())
            .spawn(move || copy_lines(stdout, log, echo_tx))
            .map_err(|e| {
                let _ = control.kill();
                let _ = control.wait();
                HarnessError::io("starting capture writer thread", e)
            })?;

        Ok(Self {
            log_path: log_path.to_path_buf(),
            control: Some(control),
            writer: Some(writer),
            echo_drained,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Wait up to `grace` for the capture process to exit (it ends when the
    /// session is stopped), kill it otherwise, then join the writer.
    pub fn finish(mut self, grace: Duration) -> Result<CaptureSummary, HarnessError> {
        let mut killed = false;
        if let Some(mut control) = self.control.take() {
            match wait_or_kill(control.as_mut(), grace) {
                Ok(was_killed) => killed = was_killed,
                Err(e) => {
                    // Closing the pipe lets Drop join the writer.
                    let _ = control.kill();
                    let _ = control.wait();
                    return Err(e);
                }
            }
        }

        let lines = match self.writer.take() {
            Some(writer) => writer
                .join()
                .map_err(|_| {
                    HarnessError::Precondition("capture writer thread panicked".to_string())
                })?
                .map_err(|e| {
                    HarnessError::io(
                        format!("writing capture log '{}'", self.log_path.display()),
                        e,
                    )
                })?,
            None => 0,
        };

        if let Some(drained) = self.echo_drained.take() {
            if drained.recv_timeout(grace).is_err() {
                warn!("console echo still blocked after {grace:?}; leaving it behind");
            }
        }
        Ok(CaptureSummary { lines, killed })
    }
}

/// Returns whether the process had to be killed.
fn wait_or_kill(control: &mut dyn ProcessControl, grace: Duration) -> Result<bool, HarnessError> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(outcome) = control.try_wait()? {
            debug!(code = ?outcome.code, "capture process exited");
            return Ok(false);
        }
        if Instant::now() >= deadline {
            warn!("capture process still running after {grace:?}; killing it");
            control.kill()?;
            control.wait()?;
            return Ok(true);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Print lines received on the returned sender to stdout. The receiver
/// fires once every sender is gone and the backlog is printed.
fn start_echo() -> Result<(Sender<Vec<u8>>, Receiver<()>), HarnessError> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let (done_tx, done_rx) = mpsc::channel();
    thread::Builder::new()
        .name("capture-echo".to_string())
        .spawn(move || {
            for line in rx {
                let mut stdout = io::stdout().lock();
                if stdout.write_all(&line).and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            let _ = done_tx.send(());
        })
        .map_err(|e| HarnessError::io("starting capture echo thread", e))?;
    Ok((tx, done_rx))
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(mut control) = self.control.take() {
            let _ = control.kill();
            let _ = control.wait();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Copy `source` line by line into `log`, flushing each line.
fn copy_lines(
    source: Box<dyn Read + Send>,
    log: File,
    echo: Option<Sender<Vec<u8>>>,
) -> io::Result<u64> {
    let mut reader = BufReader::new(source);
    let mut log = BufWriter::new(log);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        log.write_all(&line)?;
        log.flush()?;
        if let Some(echo) = &echo {
            // A gone echo thread only loses console output.
            let _ = echo.send(line.clone());
        }
        count += 1;
    }
    log.flush()?;
    Ok(count)
}
