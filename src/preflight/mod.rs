//! Preflight checks for host tools.
//!
//! Every stage shells out to host programs; checking for them up front turns
//! a confusing spawn failure halfway through a pipeline into one message
//! listing everything that is missing.
//!
//! # Example
//!
//! ```rust,ignore
//! use ecu_harness::pipeline::{plan, Stage};
//! use ecu_harness::preflight::check_stages;
//!
//! check_stages(&plan(Stage::Run), &config)?;
//! ```

use anyhow::{bail, Result};

use crate::config::HarnessConfig;
use crate::pipeline::Stage;

/// Check if a command exists on the host `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools `stage` invokes directly, as (command, package) pairs.
///
/// Everything else (compiler, `ip`, `candump`, the emulator) runs inside
/// the container image.
pub fn required_tools(stage: Stage, config: &HarnessConfig) -> Vec<(String, String)> {
    let engine = config.container.engine.clone();
    let git = ("git".to_string(), "git".to_string());
    match stage {
        Stage::FetchDependencies => vec![git],
        Stage::BuildBaseImage => vec![git, (engine.clone(), engine)],
        Stage::BuildImage | Stage::BuildFirmware | Stage::Run => vec![(engine.clone(), engine)],
        Stage::Clean => Vec::new(),
    }
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the tools for every stage in `stages`, each tool once.
pub fn check_stages(stages: &[Stage], config: &HarnessConfig) -> Result<()> {
    let mut tools: Vec<(String, String)> = Vec::new();
    for &stage in stages {
        for tool in required_tools(stage, config) {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
    }
    let borrowed: Vec<(&str, &str)> = tools
        .iter()
        .map(|(t, p)| (t.as_str(), p.as_str()))
        .collect();
    check_required_tools(&borrowed)
}
