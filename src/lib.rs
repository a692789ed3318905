//! Build-and-run harness for RISC-V ECU firmware under the Renode emulator.
//!
//! The harness drives external tools (git, a container engine and, inside
//! the container, the cross compiler, `ip`, `candump` and Renode) through a
//! fixed pipeline:
//!
//! ```text
//! fetch-dependencies ─▶ build-firmware ─┐
//! build-base-image ─▶ build-image ──────┴─▶ run ─▶ capture log dump
//! ```
//!
//! - **Process layer** ([`process`]) - `Cmd` builder and the `CommandRunner` seam
//! - **Container execution** ([`executor`]) - one-shot containers and long-lived sessions
//! - **Build stages** ([`pipeline`]) - fetch, image builds, compile, clean, stage planning
//! - **Runtime** ([`runtime`]) - CAN link state machine, capture, emulator supervision
//! - **Preflight checks** ([`preflight`]) - host tool validation before a stage runs
//!
//! Every component receives the workspace root through [`config::HarnessConfig`];
//! nothing depends on the process working directory.

pub mod config;
pub mod error;
pub mod executor;
pub mod lock;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod record;
pub mod runtime;
pub mod telemetry;

pub use config::HarnessConfig;
pub use error::HarnessError;
pub use pipeline::{plan, Pipeline, Stage, StageFailure};
pub use runtime::emulator::RunResult;
