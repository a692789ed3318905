//! Error taxonomy for the build-and-run pipeline.
//!
//! Stage failures wrap the [`HarnessError::CommandFailed`] that caused them,
//! so the process exit code of the failing external tool survives up to the
//! binary (see [`HarnessError::exit_code`]).

use thiserror::Error;

use crate::runtime::link::LinkStep;

/// Exit code used when no external process supplied one.
pub const INTERNAL_FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// An external process ran and exited non-zero (or was killed by a signal).
    #[error("command `{command}` failed ({})", describe_exit(*exit_code))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },

    /// An external program could not be started at all.
    #[error("failed to launch `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching dependency '{name}' failed")]
    DependencyFetchFailed {
        name: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("building image '{tag}' failed")]
    ImageBuildFailed {
        tag: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("compiling '{output}' failed")]
    CompileFailed {
        output: String,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("bringing up link '{interface}' failed at step {step}")]
    LinkSetupFailed {
        interface: String,
        step: LinkStep,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("emulator exited with status {code}")]
    EmulatorNonZeroExit { code: i32 },

    #[error("{0}")]
    Precondition(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code the binary should terminate with for this error.
    ///
    /// Wrapped stage errors report the code of the external command that
    /// caused them; internal failures report [`INTERNAL_FAILURE_EXIT_CODE`].
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed { exit_code, .. } => exit_code
                .filter(|code| *code != 0)
                .unwrap_or(INTERNAL_FAILURE_EXIT_CODE),
            Self::EmulatorNonZeroExit { code } => *code,
            Self::DependencyFetchFailed { source, .. }
            | Self::ImageBuildFailed { source, .. }
            | Self::CompileFailed { source, .. }
            | Self::LinkSetupFailed { source, .. } => source.exit_code(),
            Self::Spawn { .. } | Self::Precondition(_) | Self::Io { .. } => {
                INTERNAL_FAILURE_EXIT_CODE
            }
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}
