//! Host process execution.
//!
//! Every external tool the harness drives (git, the container engine, and
//! through it the compiler, `ip`, `candump` and Renode) is described by a
//! [`Cmd`] and executed through a [`CommandRunner`]. [`HostRunner`] is the
//! real implementation; tests substitute a recording fake.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::debug;

use crate::error::HarnessError;

/// A command line plus how its output should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    discard_stdout: bool,
    discard_stderr: bool,
    allow_fail: bool,
    keep_stdin: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            discard_stdout: false,
            discard_stderr: false,
            allow_fail: false,
            keep_stdin: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Discard both stdout and stderr.
    pub fn quiet(mut self) -> Self {
        self.discard_stdout = true;
        self.discard_stderr = true;
        self
    }

    pub fn discard_stdout(mut self) -> Self {
        self.discard_stdout = true;
        self
    }

    /// A non-zero exit is returned as an outcome instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// When spawned, pipe stdin from the harness and hand the write end
    /// back in [`SpawnedProcess::stdin`].
    pub fn keep_stdin(mut self) -> Self {
        self.keep_stdin = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn allows_failure(&self) -> bool {
        self.allow_fail
    }

    pub fn keeps_stdin(&self) -> bool {
        self.keep_stdin
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if self.discard_stdout {
            cmd.stdout(Stdio::null());
        }
        if self.discard_stderr {
            cmd.stderr(Stdio::null());
        }
        cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote an argument for display so logged command lines can be pasted into a shell.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Lifecycle control over a process started with [`CommandRunner::spawn`].
pub trait ProcessControl: Send {
    fn try_wait(&mut self) -> Result<Option<ProcessOutcome>, HarnessError>;
    fn kill(&mut self) -> Result<(), HarnessError>;
    fn wait(&mut self) -> Result<ProcessOutcome, HarnessError>;
}

impl ProcessControl for Child {
    fn try_wait(&mut self) -> Result<Option<ProcessOutcome>, HarnessError> {
        Child::try_wait(self)
            .map(|status| status.map(ProcessOutcome::from))
            .map_err(|e| HarnessError::io("polling background process", e))
    }

    fn kill(&mut self) -> Result<(), HarnessError> {
        match Child::kill(self) {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(HarnessError::io("killing background process", e)),
        }
    }

    fn wait(&mut self) -> Result<ProcessOutcome, HarnessError> {
        Child::wait(self)
            .map(ProcessOutcome::from)
            .map_err(|e| HarnessError::io("waiting for background process", e))
    }
}

/// A background process whose stdout is piped back to the harness.
pub struct SpawnedProcess {
    /// Empty when the command discards stdout.
    pub stdout: Box<dyn Read + Send>,
    /// Write end of stdin for [`Cmd::keep_stdin`] commands. Closing it
    /// (including by the harness exiting) delivers EOF to the process.
    pub stdin: Option<Box<dyn Write + Send>>,
    pub control: Box<dyn ProcessControl>,
}

/// Executes [`Cmd`]s.
pub trait CommandRunner {
    /// Run to completion with stdin and (unless discarded) output inherited.
    fn status(&self, cmd: &Cmd) -> Result<ProcessOutcome, HarnessError>;

    /// Start without waiting; stdout is piped into [`SpawnedProcess::stdout`]
    /// unless discarded.
    fn spawn(&self, cmd: &Cmd) -> Result<SpawnedProcess, HarnessError>;

    /// Like [`CommandRunner::status`], but a non-zero exit becomes
    /// [`HarnessError::CommandFailed`] unless the command allows failure.
    fn run(&self, cmd: &Cmd) -> Result<ProcessOutcome, HarnessError> {
        let outcome = self.status(cmd)?;
        if outcome.success() || cmd.allows_failure() {
            return Ok(outcome);
        }
        Err(HarnessError::CommandFailed {
            command: cmd.to_string(),
            exit_code: outcome.code,
        })
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn status(&self, cmd: &Cmd) -> Result<ProcessOutcome, HarnessError> {
        debug!(command = %cmd, "running");
        let status = cmd
            .to_command()
            .status()
            .map_err(|source| HarnessError::Spawn {
                program: cmd.program().to_string(),
                source,
            })?;
        Ok(status.into())
    }

    fn spawn(&self, cmd: &Cmd) -> Result<SpawnedProcess, HarnessError> {
        debug!(command = %cmd, "spawning");
        let mut command = cmd.to_command();
        command.stdin(if cmd.keep_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if !cmd.discard_stdout {
            command.stdout(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            program: cmd.program().to_string(),
            source,
        })?;

        let stdout: Box<dyn Read + Send> = match child.stdout.take() {
            Some(stdout) => Box::new(stdout),
            None if cmd.discard_stdout => Box::new(io::empty()),
            None => {
                return Err(HarnessError::Precondition(format!(
                    "stdout of `{cmd}` was not captured"
                )))
            }
        };
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>);
        Ok(SpawnedProcess {
            stdout,
            stdin,
            control: Box::new(child),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording runner with scripted exit codes.

    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum CallKind {
        Run,
        Spawn,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct Call {
        pub(crate) kind: CallKind,
        pub(crate) command: String,
        pub(crate) cwd: Option<PathBuf>,
    }

    struct Rule {
        pattern: String,
        code: i32,
        remaining: Option<usize>,
    }

    type Hook = Box<dyn Fn(&Cmd) + Send + Sync>;

    /// Every call is recorded in order; the first matching rule decides the
    /// exit code (default 0). Hooks simulate side effects such as a clone
    /// creating its directory.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        calls: Mutex<Vec<Call>>,
        rules: Mutex<Vec<Rule>>,
        hooks: Vec<(String, Hook)>,
        call_hooks: Vec<(String, Hook)>,
        spawn_output: Vec<(String, Vec<u8>)>,
        open_stdin: Arc<AtomicUsize>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn exit_with(self, pattern: &str, code: i32) -> Self {
            self.push_rule(pattern, code, None)
        }

        pub(crate) fn exit_once_with(self, pattern: &str, code: i32) -> Self {
            self.push_rule(pattern, code, Some(1))
        }

        fn push_rule(self, pattern: &str, code: i32, remaining: Option<usize>) -> Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                code,
                remaining,
            });
            self
        }

        pub(crate) fn on_success(
            mut self,
            pattern: &str,
            hook: impl Fn(&Cmd) + Send + Sync + 'static,
        ) -> Self {
            self.hooks.push((pattern.to_string(), Box::new(hook)));
            self
        }

        /// Like [`FakeRunner::on_success`] but runs whatever the exit code.
        pub(crate) fn on_call(
            mut self,
            pattern: &str,
            hook: impl Fn(&Cmd) + Send + Sync + 'static,
        ) -> Self {
            self.call_hooks.push((pattern.to_string(), Box::new(hook)));
            self
        }

        /// Stdin handles handed out by `spawn` that have not been dropped.
        pub(crate) fn open_stdin_handles(&self) -> usize {
            self.open_stdin.load(Ordering::SeqCst)
        }

        pub(crate) fn spawn_emits(mut self, pattern: &str, output: &str) -> Self {
            self.spawn_output
                .push((pattern.to_string(), output.as_bytes().to_vec()));
            self
        }

        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.command).collect()
        }

        pub(crate) fn count_matching(&self, pattern: &str) -> usize {
            self.commands()
                .iter()
                .filter(|c| c.contains(pattern))
                .count()
        }

        /// Index of the first recorded call containing `pattern`.
        pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
            self.commands().iter().position(|c| c.contains(pattern))
        }

        fn record(&self, kind: CallKind, cmd: &Cmd) -> String {
            let rendered = cmd.to_string();
            self.calls.lock().unwrap().push(Call {
                kind,
                command: rendered.clone(),
                cwd: cmd.cwd().map(Path::to_path_buf),
            });
            rendered
        }

        fn code_for(&self, rendered: &str) -> i32 {
            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                if !rendered.contains(&rule.pattern) {
                    continue;
                }
                match rule.remaining {
                    Some(0) => continue,
                    Some(n) => rule.remaining = Some(n - 1),
                    None => {}
                }
                return rule.code;
            }
            0
        }
    }

    struct FinishedControl;

    /// Counts itself in `open` until dropped.
    struct TrackedStdin {
        open: Arc<AtomicUsize>,
    }

    impl TrackedStdin {
        fn new(open: &Arc<AtomicUsize>) -> Self {
            open.fetch_add(1, Ordering::SeqCst);
            Self {
                open: Arc::clone(open),
            }
        }
    }

    impl Write for TrackedStdin {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for TrackedStdin {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ProcessControl for FinishedControl {
        fn try_wait(&mut self) -> Result<Option<ProcessOutcome>, HarnessError> {
            Ok(Some(ProcessOutcome::exited(0)))
        }

        fn kill(&mut self) -> Result<(), HarnessError> {
            Ok(())
        }

        fn wait(&mut self) -> Result<ProcessOutcome, HarnessError> {
            Ok(ProcessOutcome::exited(0))
        }
    }

    impl CommandRunner for FakeRunner {
        fn status(&self, cmd: &Cmd) -> Result<ProcessOutcome, HarnessError> {
            let rendered = self.record(CallKind::Run, cmd);
            let code = self.code_for(&rendered);
            for (pattern, hook) in &self.call_hooks {
                if rendered.contains(pattern.as_str()) {
                    hook(cmd);
                }
            }
            if code == 0 {
                for (pattern, hook) in &self.hooks {
                    if rendered.contains(pattern.as_str()) {
                        hook(cmd);
                    }
                }
            }
            Ok(ProcessOutcome::exited(code))
        }

        fn spawn(&self, cmd: &Cmd) -> Result<SpawnedProcess, HarnessError> {
            let rendered = self.record(CallKind::Spawn, cmd);
            let output = self
                .spawn_output
                .iter()
                .find(|(pattern, _)| rendered.contains(pattern.as_str()))
                .map(|(_, bytes)| bytes.clone())
                .unwrap_or_default();
            let stdin = cmd
                .keeps_stdin()
                .then(|| Box::new(TrackedStdin::new(&self.open_stdin)) as Box<dyn Write + Send>);
            Ok(SpawnedProcess {
                stdout: Box::new(Cursor::new(output)),
                stdin,
                control: Box::new(FinishedControl),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = Cmd::new("bash").args(["-c", "echo hi"]);
        assert_eq!(cmd.to_string(), "bash -c 'echo hi'");
    }

    #[test]
    fn display_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn run_turns_nonzero_exit_into_command_failed() {
        let runner = FakeRunner::new().exit_with("false", 7);
        let err = runner.run(&Cmd::new("false")).unwrap_err();
        match err {
            HarnessError::CommandFailed { command, exit_code } => {
                assert_eq!(command, "false");
                assert_eq!(exit_code, Some(7));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn run_allows_failure_when_requested() {
        let runner = FakeRunner::new().exit_with("false", 7);
        let outcome = runner.run(&Cmd::new("false").allow_fail()).unwrap();
        assert_eq!(outcome.code, Some(7));
        assert!(!outcome.success());
    }

    #[test]
    fn host_runner_reports_exit_codes() {
        let outcome = HostRunner
            .status(&Cmd::new("sh").args(["-c", "exit 3"]))
            .unwrap();
        assert_eq!(outcome.code, Some(3));
    }

    #[test]
    fn host_runner_spawn_pipes_stdout() {
        let mut spawned = HostRunner
            .spawn(&Cmd::new("sh").args(["-c", "echo frame"]))
            .unwrap();
        let mut out = String::new();
        spawned.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "frame");
        assert!(spawned.control.wait().unwrap().success());
    }

    #[test]
    fn closing_kept_stdin_ends_a_stdin_bound_process() {
        let mut spawned = HostRunner
            .spawn(&Cmd::new("cat").keep_stdin().discard_stdout())
            .unwrap();
        assert!(spawned.stdin.is_some());
        assert!(spawned.control.try_wait().unwrap().is_none());

        drop(spawned.stdin.take());

        assert!(spawned.control.wait().unwrap().success());
    }

    #[test]
    fn host_runner_reports_missing_program() {
        let err = HostRunner
            .status(&Cmd::new("definitely_not_a_real_command_12345"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }));
    }
}
