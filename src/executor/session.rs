//! Long-lived privileged container session.
//!
//! The session container's main process is `cat` reading the stdin of an
//! attached `run -i` client that the harness keeps open. Every step is a
//! separate `exec` into it, so the virtual link, the capture process and
//! the emulator all share one network namespace.
//!
//! The container lives exactly as long as that stdin pipe. [`stop`] removes
//! it explicitly; if the harness dies without unwinding (interrupt, kill),
//! the operating system closes the pipe, `cat` sees EOF and the container
//! exits and is removed together with everything exec'd into it.
//!
//! [`stop`]: ExecutionSession::stop

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{ContainerExecutor, ExecFlags};
use crate::error::HarnessError;
use crate::process::{Cmd, CommandRunner, ProcessOutcome, SpawnedProcess};

const START_TIMEOUT: Duration = Duration::from_secs(30);
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ExecutionSession<'a> {
    name: String,
    engine: String,
    flags: ExecFlags,
    runner: &'a dyn CommandRunner,
    /// The attached `run -i` client; holds the container's stdin.
    anchor: Option<SpawnedProcess>,
}

impl<'a> ExecutionSession<'a> {
    /// Start session container `name` and wait until it accepts `exec`.
    ///
    /// `flags.privileged` applies to the container; `interactive` and `pty`
    /// apply to foreground execs ([`ExecutionSession::foreground`]).
    pub fn start(
        executor: &ContainerExecutor<'a>,
        name: &str,
        flags: ExecFlags,
    ) -> Result<Self, HarnessError> {
        let mut cmd = Cmd::new(executor.engine()).args(["run", "-i", "--rm"]);
        if flags.privileged {
            cmd = cmd.arg("--privileged");
        }
        let cmd = cmd
            .args(["--name", name])
            .args(executor.mount_args())
            .args(["--entrypoint", "cat"])
            .arg(executor.image())
            .keep_stdin()
            .discard_stdout();

        info!(session = name, image = executor.image(), "starting session container");
        let anchor = executor.runner().spawn(&cmd)?;

        let mut session = Self {
            name: name.to_string(),
            engine: executor.engine().to_string(),
            flags,
            runner: executor.runner(),
            anchor: Some(anchor),
        };
        session.wait_until_ready(&cmd)?;
        Ok(session)
    }

    fn wait_until_ready(&mut self, start: &Cmd) -> Result<(), HarnessError> {
        let ready_check = self.step(&["true".to_string()]).quiet().allow_fail();
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            if self.runner.run(&ready_check)?.success() {
                debug!(session = %self.name, "session container ready");
                return Ok(());
            }
            let exited = match self.anchor.as_mut() {
                Some(anchor) => anchor.control.try_wait()?,
                None => None,
            };
            if let Some(outcome) = exited {
                self.anchor = None;
                return Err(HarnessError::CommandFailed {
                    command: start.to_string(),
                    exit_code: outcome.code,
                });
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Precondition(format!(
                    "session container '{}' not ready after {START_TIMEOUT:?}",
                    self.name
                )));
            }
            thread::sleep(START_POLL_INTERVAL);
        }
    }

    fn exec(&self, argv: &[String], interactive: bool, pty: bool) -> Cmd {
        let mut cmd = Cmd::new(self.engine.as_str()).arg("exec");
        if interactive {
            cmd = cmd.arg("-i");
        }
        if pty {
            cmd = cmd.arg("-t");
        }
        cmd.arg(self.name.as_str()).args(argv.iter().cloned())
    }

    /// Non-interactive exec of `argv`.
    pub fn step(&self, argv: &[String]) -> Cmd {
        self.exec(argv, false, false)
    }

    /// Exec of `argv` carrying the session's interactive and pty flags.
    pub fn foreground(&self, argv: &[String]) -> Cmd {
        self.exec(argv, self.flags.interactive, self.flags.pty)
    }

    pub fn run(&self, cmd: &Cmd) -> Result<ProcessOutcome, HarnessError> {
        self.runner.run(cmd)
    }

    pub fn spawn(&self, cmd: &Cmd) -> Result<SpawnedProcess, HarnessError> {
        self.runner.spawn(cmd)
    }

    /// Remove the container, terminating every process in it, then release
    /// the attached client. Idempotent.
    pub fn stop(&mut self) -> Result<(), HarnessError> {
        let Some(mut anchor) = self.anchor.take() else {
            return Ok(());
        };
        debug!(session = %self.name, "stopping session container");
        let cmd = Cmd::new(self.engine.as_str())
            .args(["rm", "-f", self.name.as_str()])
            .quiet();
        let removed = self.runner.run(&cmd).map(|_| ());

        // EOF ends `cat` even if the removal above failed.
        drop(anchor.stdin.take());
        anchor.control.wait()?;
        removed
    }
}

impl Drop for ExecutionSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(session = %self.name, "failed to stop session container: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::process::testing::{CallKind, FakeRunner};
    use std::path::Path;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn start_runs_stdin_bound_privileged_container() {
        let config = HarnessConfig::defaults(Path::new("/w"));
        let runner = FakeRunner::new();
        let executor = ContainerExecutor::new(&config, "riscv-ecu-renode", &runner);
        let flags = ExecFlags {
            interactive: true,
            privileged: true,
            pty: false,
        };
        let session = ExecutionSession::start(&executor, "ecu-harness-test", flags).unwrap();
        drop(session);

        assert_eq!(
            runner.commands(),
            [
                "docker run -i --rm --privileged --name ecu-harness-test -v /w:/app -w /app \
                 --entrypoint cat riscv-ecu-renode",
                "docker exec ecu-harness-test true",
                "docker rm -f ecu-harness-test",
            ]
        );
        assert_eq!(runner.calls()[0].kind, CallKind::Spawn);
    }

    #[test]
    fn container_stdin_is_held_while_the_session_lives() {
        let config = HarnessConfig::defaults(Path::new("/w"));
        let runner = FakeRunner::new();
        let executor = ContainerExecutor::new(&config, "img", &runner);

        let session = ExecutionSession::start(&executor, "s", ExecFlags::default()).unwrap();
        assert_eq!(runner.open_stdin_handles(), 1);

        drop(session);
        assert_eq!(runner.open_stdin_handles(), 0);
        assert_eq!(runner.count_matching("rm -f s"), 1);
    }

    #[test]
    fn session_exiting_during_startup_is_an_error() {
        let config = HarnessConfig::defaults(Path::new("/w"));
        let runner = FakeRunner::new().exit_with("exec s true", 1);
        let executor = ContainerExecutor::new(&config, "img", &runner);

        let err = ExecutionSession::start(&executor, "s", ExecFlags::default())
            .err()
            .unwrap();

        assert!(matches!(err, HarnessError::CommandFailed { .. }));
        assert_eq!(runner.open_stdin_handles(), 0);
    }

    #[test]
    fn foreground_exec_carries_session_flags() {
        let config = HarnessConfig::defaults(Path::new("/w"));
        let runner = FakeRunner::new();
        let executor = ContainerExecutor::new(&config, "img", &runner);
        let flags = ExecFlags {
            interactive: true,
            privileged: true,
            pty: true,
        };
        let session = ExecutionSession::start(&executor, "s", flags).unwrap();

        let step = session.step(&argv(&["ip", "link"]));
        let fg = session.foreground(&argv(&["renode", "run.resc"]));

        assert_eq!(step.to_string(), "docker exec s ip link");
        assert_eq!(fg.to_string(), "docker exec -i -t s renode run.resc");
    }

    #[test]
    fn stop_is_idempotent() {
        let config = HarnessConfig::defaults(Path::new("/w"));
        let runner = FakeRunner::new();
        let executor = ContainerExecutor::new(&config, "img", &runner);
        let mut session = ExecutionSession::start(&executor, "s", ExecFlags::default()).unwrap();

        session.stop().unwrap();
        session.stop().unwrap();
        drop(session);

        assert_eq!(runner.count_matching("rm -f"), 1);
    }
}
