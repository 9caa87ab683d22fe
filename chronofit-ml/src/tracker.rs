//! Experiment tracker adapter.
//!
//! Sessions are organized as project / group / run. [`open_tracker`] returns an
//! inert [`DisabledTracker`] when tracking is off, otherwise authenticates and
//! opens a [`FileTracker`] session that persists the configuration view and a
//! metrics stream under `<log_dir>/tracker`.

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::persistence::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variables consulted for the tracker API key, in order.
pub const API_KEY_VARS: [&str; 2] = ["CHRONOFIT_TRACKER_API_KEY", "WANDB_API_KEY"];

const UNGROUPED: &str = "ungrouped";

const ADJECTIVES: [&str; 16] = [
    "amber", "bold", "calm", "dainty", "eager", "fresh", "gentle", "hardy", "icy", "jolly",
    "lucid", "misty", "noble", "proud", "quiet", "rosy",
];
const NOUNS: [&str; 16] = [
    "brook", "cloud", "dawn", "field", "frost", "grove", "haze", "lake", "meadow", "moon",
    "pine", "river", "sky", "star", "sun", "wave",
];

/// Project, group and run name of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub project: String,
    pub group: Option<String>,
    pub name: String,
}

impl RunIdentity {
    /// Identity for a run without a tracker session: named by local time.
    pub fn local(config: &ExperimentConfig) -> Self {
        Self {
            project: config.tracker_project.clone(),
            group: config.tracker_group.clone(),
            name: chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string(),
        }
    }
}

/// Sink for the configuration and metrics of one run.
pub trait Tracker: Send {
    /// Name assigned by the tracking backend, if any.
    fn run_name(&self) -> Option<&str>;

    fn log_config(&mut self, view: &BTreeMap<String, Value>) -> Result<(), MlError>;

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<(), MlError>;

    fn finish(&mut self) -> Result<(), MlError>;
}

/// No-op tracker used when tracking is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTracker;

impl Tracker for DisabledTracker {
    fn run_name(&self) -> Option<&str> {
        None
    }

    fn log_config(&mut self, _view: &BTreeMap<String, Value>) -> Result<(), MlError> {
        Ok(())
    }

    fn log_metrics(&mut self, _metrics: &BTreeMap<String, f64>, _step: u64) -> Result<(), MlError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MlError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RunRecord {
    id: String,
    identity: RunIdentity,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct MetricsLine<'a> {
    step: u64,
    timestamp: DateTime<Utc>,
    metrics: &'a BTreeMap<String, f64>,
}

/// Tracker session persisted under `<root>/<project>/<group>/<run>`.
#[derive(Debug)]
pub struct FileTracker {
    dir: PathBuf,
    record: RunRecord,
    metrics: std::fs::File,
}

impl FileTracker {
    /// Open a new session, assigning a fresh `<adjective>-<noun>-<n>` run name
    /// where `n` counts the runs of the group.
    pub fn open(root: &Path, project: &str, group: Option<&str>) -> Result<Self, MlError> {
        let group_dir = root.join(project).join(group.unwrap_or(UNGROUPED));
        std::fs::create_dir_all(&group_dir)
            .map_err(|e| MlError::tracker(format!("cannot create {}: {e}", group_dir.display())))?;
        let existing = std::fs::read_dir(&group_dir)?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .count();

        let id = uuid::Uuid::new_v4();
        let bytes = id.as_bytes();
        let name = format!(
            "{}-{}-{}",
            ADJECTIVES[usize::from(bytes[0]) % ADJECTIVES.len()],
            NOUNS[usize::from(bytes[1]) % NOUNS.len()],
            existing + 1
        );
        let dir = group_dir.join(&name);
        std::fs::create_dir_all(&dir)?;

        let record = RunRecord {
            id: id.to_string(),
            identity: RunIdentity {
                project: project.to_string(),
                group: group.map(str::to_string),
                name,
            },
            started_at: Utc::now(),
            finished_at: None,
        };
        atomic_write_json(&dir.join("run.json"), &record)?;
        let metrics = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        tracing::info!(run = %record.identity.name, dir = %dir.display(), "Opened tracker session");
        Ok(Self {
            dir,
            record,
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.record.identity
    }
}

impl Tracker for FileTracker {
    fn run_name(&self) -> Option<&str> {
        Some(&self.record.identity.name)
    }

    fn log_config(&mut self, view: &BTreeMap<String, Value>) -> Result<(), MlError> {
        atomic_write_json(&self.dir.join("config.json"), view)?;
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<(), MlError> {
        let line = serde_json::to_string(&MetricsLine {
            step,
            timestamp: Utc::now(),
            metrics,
        })?;
        writeln!(self.metrics, "{line}")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MlError> {
        self.metrics.flush()?;
        self.record.finished_at = Some(Utc::now());
        atomic_write_json(&self.dir.join("run.json"), &self.record)?;
        Ok(())
    }
}

/// The API key from the configuration or, failing that, the environment.
pub fn resolve_api_key(config: &ExperimentConfig) -> Option<String> {
    config
        .tracker_api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| {
            API_KEY_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|k| !k.is_empty()))
        })
}

/// Open the tracker session for a run.
///
/// Missing credentials with tracking enabled are a tracker error.
pub fn open_tracker(config: &ExperimentConfig) -> Result<Box<dyn Tracker>, MlError> {
    if !config.tracking {
        return Ok(Box::new(DisabledTracker));
    }
    if resolve_api_key(config).is_none() {
        return Err(MlError::tracker(format!(
            "tracking is enabled but no API key was given (--tracker-api-key, {} or {})",
            API_KEY_VARS[0], API_KEY_VARS[1]
        )));
    }
    let tracker = FileTracker::open(
        &config.log_dir.join("tracker"),
        &config.tracker_project,
        config.tracker_group.as_deref(),
    )?;
    Ok(Box::new(tracker))
}
