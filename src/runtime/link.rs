//! Virtual CAN link bring-up.
//!
//! Driven as a state machine over individual `exec` calls into the session:
//!
//! ```text
//! Check ──present──────────────────────────────┐
//!   │ absent                                   ▼
//! DirectCreate ──ok──────────────────────────▶ Up
//!   │ failed                                   ▲
//! ModuleLoad (failure ignored) ─▶ CreateRetry ─┘
//!                                   │ failed
//!                                   ▼
//!                          LinkSetupFailed (fatal)
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use super::RuntimeSettings;
use crate::error::HarnessError;
use crate::executor::session::ExecutionSession;
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Check,
    DirectCreate,
    ModuleLoad,
    CreateRetry,
    Up,
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStep::Check => "check",
            LinkStep::DirectCreate => "direct-create",
            LinkStep::ModuleLoad => "module-load",
            LinkStep::CreateRetry => "create-retry",
            LinkStep::Up => "up",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Created,
    Up,
    Failed,
}

/// Steps taken and where the link ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub steps: Vec<LinkStep>,
    pub state: LinkState,
}

pub struct LinkBootstrapper<'s, 'a> {
    session: &'s ExecutionSession<'a>,
    settings: &'s RuntimeSettings,
}

impl<'s, 'a> LinkBootstrapper<'s, 'a> {
    pub fn new(session: &'s ExecutionSession<'a>, settings: &'s RuntimeSettings) -> Self {
        Self { session, settings }
    }

    /// Bring the interface up, creating it if needed.
    ///
    /// The module-load fallback runs at most once; if creation still fails
    /// afterwards the whole run is aborted.
    pub fn establish(&self) -> Result<LinkReport, HarnessError> {
        let interface = self.settings.interface.as_str();
        info!(interface, "setting up virtual CAN link");

        let mut report = LinkReport {
            steps: Vec::new(),
            state: LinkState::Absent,
        };
        let mut next = Some(LinkStep::Check);

        while let Some(step) = next {
            report.steps.push(step);
            next = match self.advance(step, &mut report.state) {
                Ok(next) => next,
                Err(source) => {
                    report.state = LinkState::Failed;
                    debug!(?report, "link setup failed");
                    return Err(HarnessError::LinkSetupFailed {
                        interface: interface.to_string(),
                        step,
                        source: Box::new(source),
                    });
                }
            };
        }

        Ok(report)
    }

    fn advance(
        &self,
        step: LinkStep,
        state: &mut LinkState,
    ) -> Result<Option<LinkStep>, HarnessError> {
        let interface = self.settings.interface.as_str();
        let next = match step {
            LinkStep::Check => {
                let check = self.session.step(&self.argv(false, &["ip", "link", "show", interface]));
                if self.session.run(&check.quiet().allow_fail())?.success() {
                    debug!(interface, "interface already present");
                    *state = LinkState::Created;
                    Some(LinkStep::Up)
                } else {
                    Some(LinkStep::DirectCreate)
                }
            }
            LinkStep::DirectCreate => {
                if self.session.run(&self.create().quiet().allow_fail())?.success() {
                    *state = LinkState::Created;
                    Some(LinkStep::Up)
                } else {
                    warn!(interface, "creation failed, attempting to load kernel module");
                    Some(LinkStep::ModuleLoad)
                }
            }
            LinkStep::ModuleLoad => {
                let module = self.settings.kernel_module.as_str();
                let load = self.session.step(&self.argv(true, &["modprobe", module]));
                let outcome = self.session.run(&load.quiet().allow_fail())?;
                if !outcome.success() {
                    debug!(module, "modprobe failed; module may be built in");
                }
                Some(LinkStep::CreateRetry)
            }
            LinkStep::CreateRetry => {
                self.session.run(&self.create())?;
                *state = LinkState::Created;
                Some(LinkStep::Up)
            }
            LinkStep::Up => {
                let up = self.argv(true, &["ip", "link", "set", "up", interface]);
                self.session.run(&self.session.step(&up))?;
                let show = self.argv(false, &["ip", "link", "show", interface]);
                self.session.run(&self.session.step(&show))?;
                *state = LinkState::Up;
                None
            }
        };
        Ok(next)
    }

    fn create(&self) -> Cmd {
        let interface = self.settings.interface.as_str();
        self.session.step(&self.argv(
            true,
            &["ip", "link", "add", "dev", interface, "type", "vcan"],
        ))
    }

    fn argv(&self, needs_root: bool, parts: &[&str]) -> Vec<String> {
        let sudo = (needs_root && self.settings.use_sudo).then(|| "sudo".to_string());
        sudo.into_iter()
            .chain(parts.iter().map(|p| p.to_string()))
            .collect()
    }
}
