//! Run identity and the metadata for the most recent `run`, kept at
//! `.ecu-harness/last-run.json`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const RECORD_FILENAME: &str = "last-run.json";

/// Session containers are named `<prefix><run id>`.
pub const SESSION_PREFIX: &str = "ecu-harness-";

static RUN_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Identifies one harness invocation and names its session container.
///
/// `<unix millis>-<pid>-<sequence>`, each in lowercase base 36, so ids are
/// valid container names and sort by start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Result<Self> {
        let millis = u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
            .context("system clock before the Unix epoch while generating run id")?;
        let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Ok(Self(format!(
            "{}-{}-{}",
            base36(millis),
            base36(u64::from(std::process::id())),
            base36(u64::from(sequence))
        )))
    }

    pub fn session_name(&self) -> String {
        format!("{SESSION_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    /// The emulator exited non-zero.
    Failed,
    /// The harness gave up before or during the run.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub emulator_exit_code: Option<i32>,
    pub capture_log: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
}

impl RunRecord {
    pub fn start(run_id: &RunId, capture_log: &Path) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            emulator_exit_code: None,
            capture_log: capture_log.display().to_string(),
            created_at_utc: now_utc_compact()?,
            finished_at_utc: None,
        })
    }

    /// Mark finished with the emulator's exit code, or `None` if it never ran.
    pub fn finish(&mut self, emulator_exit_code: Option<i32>) -> Result<()> {
        self.status = match emulator_exit_code {
            Some(0) => RunStatus::Success,
            Some(_) => RunStatus::Failed,
            None => RunStatus::Aborted,
        };
        self.emulator_exit_code = emulator_exit_code;
        self.finished_at_utc = Some(now_utc_compact()?);
        Ok(())
    }

    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(RECORD_FILENAME)
    }

    pub fn write(&self, state_dir: &Path) -> Result<()> {
        let path = Self::path(state_dir);
        write_json_atomic(&path, self)
            .with_context(|| format!("writing run record '{}'", path.display()))
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(state_dir);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run record '{}'", path.display()))?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run record '{}'", path.display()))?;
        Ok(Some(record))
    }
}

fn now_utc_compact() -> Result<String> {
    let now = OffsetDateTime::now_utc();
    Ok(format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    ))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_id() -> RunId {
        RunId("abc".to_string())
    }

    #[test]
    fn run_ids_are_unique_container_names() {
        let a = RunId::generate().unwrap();
        let b = RunId::generate().unwrap();
        assert_ne!(a, b);

        let name = a.session_name();
        assert!(name.starts_with("ecu-harness-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn record_round_trips_through_state_dir() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join(".ecu-harness");
        assert!(RunRecord::load(&state).unwrap().is_none());

        let mut record = RunRecord::start(&run_id(), Path::new("candump.log")).unwrap();
        record.finish(Some(3)).unwrap();
        record.write(&state).unwrap();

        let loaded = RunRecord::load(&state).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.finished_at_utc.is_some());

        let raw = fs::read_to_string(RunRecord::path(&state)).unwrap();
        assert!(raw.contains("\"status\": \"failed\""));
        let leftovers = fs::read_dir(&state).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn finish_without_emulator_is_aborted() {
        let mut record = RunRecord::start(&run_id(), Path::new("candump.log")).unwrap();
        record.finish(None).unwrap();
        assert_eq!(record.status, RunStatus::Aborted);
        assert_eq!(record.emulator_exit_code, None);
    }
}
