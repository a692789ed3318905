//! Harness configuration.
//!
//! The workspace root is resolved once by the caller and stored here; no
//! component consults the process working directory. An optional
//! `ecu-harness.toml` at the workspace root overrides the built-in project
//! layout field by field.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::pipeline::fetch::Dependency;
use crate::pipeline::firmware::CompileJob;
use crate::pipeline::image::ImageSpec;
use crate::runtime::{PtyMode, RuntimeSettings};

pub const DEFAULT_CONFIG_FILENAME: &str = "ecu-harness.toml";

/// Harness-owned state (lock file, run record) lives under this directory.
pub const STATE_DIR: &str = ".ecu-harness";

const DEFAULT_ENGINE: &str = "docker";
const DEFAULT_MOUNT_POINT: &str = "/app";
const DEFAULT_SHELL: &str = "bash";
const DEFAULT_BASE_TAG: &str = "renode:1.16";
const DEFAULT_IMAGE_TAG: &str = "riscv-ecu-renode";
const DEFAULT_CAPTURE_GRACE_MS: u64 = 2000;

/// (name, clone url) of the libraries compiled into the firmware.
const DEFAULT_LIBRARIES: &[(&str, &str)] = &[
    (
        "tiny-AES-CMAC-c",
        "https://github.com/elektronika-ba/tiny-AES-CMAC-c.git",
    ),
    ("tiny-AES-c", "https://github.com/kokke/tiny-AES-c.git"),
];
const DEFAULT_BASE_SOURCE: (&str, &str) = (
    "renode-docker",
    "https://github.com/renode/renode-docker.git",
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Container engine binary (`docker`, `podman`).
    pub engine: String,
    /// In-container path the workspace is mounted at.
    pub mount_point: String,
    /// Shell used for `bash -c` style one-shot commands.
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImageSettings {
    pub spec: ImageSpec,
    /// Checkout providing the base image build context.
    pub source: Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSettings {
    pub job: CompileJob,
    /// Keep going into `run` when the compile fails (warn only).
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub workspace: PathBuf,
    pub container: ContainerSettings,
    pub base_image: BaseImageSettings,
    pub image: ImageSpec,
    /// Libraries fetched by `fetch-dependencies`.
    pub dependencies: Vec<Dependency>,
    pub firmware: FirmwareSettings,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HarnessToml {
    container: Option<ContainerToml>,
    base_image: Option<BaseImageToml>,
    image: Option<ImageToml>,
    dependencies: Option<Vec<DependencyToml>>,
    firmware: Option<FirmwareToml>,
    runtime: Option<RuntimeToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerToml {
    engine: Option<String>,
    mount_point: Option<String>,
    shell: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BaseImageToml {
    tag: Option<String>,
    name: Option<String>,
    url: Option<String>,
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    tag: Option<String>,
    context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyToml {
    name: String,
    url: String,
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FirmwareToml {
    compiler: Option<String>,
    arch: Option<String>,
    abi: Option<String>,
    cflags: Option<Vec<String>>,
    include_dirs: Option<Vec<String>>,
    linker_script: Option<String>,
    ldflags: Option<Vec<String>>,
    sources: Option<Vec<String>>,
    output: Option<String>,
    continue_on_failure: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    interface: Option<String>,
    kernel_module: Option<String>,
    use_sudo: Option<bool>,
    capture_command: Option<Vec<String>>,
    capture_log: Option<String>,
    emulator_command: Option<Vec<String>>,
    echo_capture: Option<bool>,
    capture_grace_ms: Option<u64>,
    pty: Option<String>,
}

impl HarnessConfig {
    /// Load configuration for `workspace`.
    ///
    /// An explicit `config_path` must exist. Without one, the default file
    /// under the workspace is used when present, built-in defaults otherwise.
    pub fn load(workspace: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(path) => {
                if !path.is_file() {
                    bail!("configuration file not found: '{}'", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let candidate = workspace.join(DEFAULT_CONFIG_FILENAME);
                if !candidate.is_file() {
                    return Self::from_toml_str(workspace, "", &candidate);
                }
                candidate
            }
        };

        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading configuration '{}'", path.display()))?;
        Self::from_toml_str(workspace, &text, &path)
    }

    /// Built-in defaults for the stock project layout.
    pub fn defaults(workspace: &Path) -> Self {
        Self::from_toml_str(workspace, "", Path::new(DEFAULT_CONFIG_FILENAME))
            .unwrap_or_else(|e| unreachable!("built-in defaults are valid: {e:#}"))
    }

    pub fn from_toml_str(workspace: &Path, text: &str, config_path: &Path) -> Result<Self> {
        let parsed: HarnessToml = toml::from_str(text)
            .with_context(|| format!("parsing configuration '{}'", config_path.display()))?;

        let container = parsed.container.unwrap_or_default();
        let container = ContainerSettings {
            engine: non_empty(container.engine, DEFAULT_ENGINE),
            mount_point: non_empty(container.mount_point, DEFAULT_MOUNT_POINT),
            shell: non_empty(container.shell, DEFAULT_SHELL),
        };
        if !container.mount_point.starts_with('/') {
            bail!(
                "invalid configuration '{}': container.mount_point must be absolute, got '{}'",
                config_path.display(),
                container.mount_point
            );
        }

        let base = parsed.base_image.unwrap_or_default();
        let base_name = non_empty(base.name, DEFAULT_BASE_SOURCE.0);
        let base_dir = workspace_relative(
            base.dir.as_deref().unwrap_or(&base_name),
            "base_image.dir",
            config_path,
        )?;
        let base_tag = non_empty(base.tag, DEFAULT_BASE_TAG);
        let base_image = BaseImageSettings {
            spec: ImageSpec {
                tag: base_tag.clone(),
                context: base_dir.clone(),
                parent: None,
            },
            source: Dependency {
                name: base_name,
                url: non_empty(base.url, DEFAULT_BASE_SOURCE.1),
                dir: base_dir,
            },
        };

        let image = parsed.image.unwrap_or_default();
        let image = ImageSpec {
            tag: non_empty(image.tag, DEFAULT_IMAGE_TAG),
            context: match image.context {
                Some(context) => context_path(&context, config_path)?,
                None => PathBuf::from("."),
            },
            parent: Some(base_tag),
        };

        let dependencies = match parsed.dependencies {
            Some(deps) => deps
                .into_iter()
                .map(|dep| {
                    let dir = workspace_relative(
                        dep.dir.as_deref().unwrap_or(&dep.name),
                        "dependencies.dir",
                        config_path,
                    )?;
                    Ok(Dependency {
                        name: dep.name,
                        url: dep.url,
                        dir,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => DEFAULT_LIBRARIES
                .iter()
                .map(|(name, url)| Dependency {
                    name: name.to_string(),
                    url: url.to_string(),
                    dir: PathBuf::from(name),
                })
                .collect(),
        };

        let firmware = parse_firmware(parsed.firmware.unwrap_or_default(), &dependencies, config_path)?;
        let runtime = parse_runtime(parsed.runtime.unwrap_or_default(), config_path)?;

        Ok(Self {
            workspace: workspace.to_path_buf(),
            container,
            base_image,
            image,
            dependencies,
            firmware,
            runtime,
        })
    }

    /// Directory for harness-owned state.
    pub fn state_dir(&self) -> PathBuf {
        self.workspace.join(STATE_DIR)
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.workspace.join(&self.firmware.job.output)
    }

    pub fn capture_log_path(&self) -> PathBuf {
        self.workspace.join(&self.runtime.capture_log)
    }
}

fn parse_firmware(
    raw: FirmwareToml,
    dependencies: &[Dependency],
    config_path: &Path,
) -> Result<FirmwareSettings> {
    let include_dirs = match raw.include_dirs {
        Some(dirs) => dirs
            .iter()
            .map(|dir| context_path(dir, config_path))
            .collect::<Result<Vec<_>>>()?,
        None => dependencies.iter().map(|dep| dep.dir.clone()).collect(),
    };
    let sources = match raw.sources {
        Some(sources) => sources
            .iter()
            .map(|src| workspace_relative(src, "firmware.sources", config_path))
            .collect::<Result<Vec<_>>>()?,
        None => [
            "start.s",
            "main.c",
            "tiny-AES-c/aes.c",
            "tiny-AES-CMAC-c/aes_cmac.c",
        ]
        .iter()
        .map(PathBuf::from)
        .collect(),
    };
    if sources.is_empty() {
        bail!(
            "invalid configuration '{}': firmware.sources must not be empty",
            config_path.display()
        );
    }

    let output = workspace_relative(
        raw.output.as_deref().unwrap_or("firmware.elf"),
        "firmware.output",
        config_path,
    )?;
    let linker_script = workspace_relative(
        raw.linker_script.as_deref().unwrap_or("linker.ld"),
        "firmware.linker_script",
        config_path,
    )?;

    Ok(FirmwareSettings {
        job: CompileJob {
            compiler: non_empty(raw.compiler, "riscv-none-elf-gcc"),
            arch: non_empty(raw.arch, "rv32i"),
            abi: non_empty(raw.abi, "ilp32"),
            cflags: raw.cflags.unwrap_or_else(|| {
                ["-nostdlib", "-g", "-O0"].map(String::from).to_vec()
            }),
            include_dirs,
            linker_script,
            ldflags: raw
                .ldflags
                .unwrap_or_else(|| vec!["-Wl,-melf32lriscv".to_string()]),
            sources,
            output,
        },
        continue_on_failure: raw.continue_on_failure.unwrap_or(false),
    })
}

fn parse_runtime(raw: RuntimeToml, config_path: &Path) -> Result<RuntimeSettings> {
    let capture_command = raw.capture_command.unwrap_or_else(|| {
        ["candump", "-aed", "any,0:0,#FFFFFFFF"]
            .map(String::from)
            .to_vec()
    });
    let emulator_command = raw.emulator_command.unwrap_or_else(|| {
        ["renode", "--disable-xwt", "--console", "run.resc"]
            .map(String::from)
            .to_vec()
    });
    for (field, argv) in [
        ("runtime.capture_command", &capture_command),
        ("runtime.emulator_command", &emulator_command),
    ] {
        if argv.is_empty() || argv[0].trim().is_empty() {
            bail!(
                "invalid configuration '{}': {} must name a program",
                config_path.display(),
                field
            );
        }
    }

    let pty = match raw
        .pty
        .as_deref()
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        None | Some("auto") => PtyMode::Auto,
        Some("always") => PtyMode::Always,
        Some("never") => PtyMode::Never,
        Some(other) => bail!(
            "invalid configuration '{}': unsupported runtime.pty '{}' (expected 'auto', 'always' or 'never')",
            config_path.display(),
            other
        ),
    };

    Ok(RuntimeSettings {
        interface: non_empty(raw.interface, "vcan0"),
        kernel_module: non_empty(raw.kernel_module, "vcan"),
        use_sudo: raw.use_sudo.unwrap_or(true),
        capture_command,
        capture_log: workspace_relative(
            raw.capture_log.as_deref().unwrap_or("candump.log"),
            "runtime.capture_log",
            config_path,
        )?,
        emulator_command,
        echo_capture: raw.echo_capture.unwrap_or(true),
        capture_grace: Duration::from_millis(
            raw.capture_grace_ms.unwrap_or(DEFAULT_CAPTURE_GRACE_MS),
        ),
        pty,
    })
}

fn non_empty(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// A path inside the workspace naming a concrete entry (not the root itself).
///
/// These paths are removed recursively by `clean`, so anything that could
/// resolve to the workspace root or outside it is rejected.
fn workspace_relative(raw: &str, field: &str, config_path: &Path) -> Result<PathBuf> {
    let path = context_path(raw, config_path)?;
    if !path
        .components()
        .any(|component| matches!(component, Component::Normal(_)))
    {
        bail!(
            "invalid configuration '{}': {} must name an entry inside the workspace, got '{}'",
            config_path.display(),
            field,
            raw
        );
    }
    Ok(path)
}

/// A relative path that stays within the workspace (`.` allowed).
fn context_path(raw: &str, config_path: &Path) -> Result<PathBuf> {
    let candidate = Path::new(raw.trim());
    if candidate.as_os_str().is_empty() {
        bail!(
            "invalid configuration '{}': empty path",
            config_path.display()
        );
    }
    if candidate.is_absolute() {
        bail!(
            "invalid configuration '{}': path must be workspace-relative, got absolute path '{}'",
            config_path.display(),
            raw
        );
    }
    for component in candidate.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!(
                "invalid configuration '{}': path contains traversal/root component in '{}'",
                config_path.display(),
                raw
            );
        }
    }
    Ok(candidate.to_path_buf())
}
