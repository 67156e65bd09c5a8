//! Experiment tracking
//!
//! Records parameters, per-step metrics and artifact paths of a quantization
//! run. Runs persist through a pluggable [`TrackingBackend`]: JSON files on
//! disk, or memory when no directory is configured.
//!
//! The quantizer and the trainer share one open run through a [`RunHandle`].

pub mod storage;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use storage::{InMemoryBackend, JsonFileBackend, TrackingBackend, TrackingStorageError};

/// Status of a tracking run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
}

/// One recorded run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub run_name: Option<String>,
    pub experiment_name: String,
    pub status: RunStatus,
    /// String-encoded parameters
    pub params: BTreeMap<String, String>,
    /// Metric name -> (value, step) points in logging order
    pub metrics: BTreeMap<String, Vec<(f64, u64)>>,
    pub artifacts: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Run {
    fn new(run_id: String, run_name: Option<String>, experiment_name: String) -> Self {
        Self {
            run_id,
            run_name,
            experiment_name,
            status: RunStatus::Active,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            tags: BTreeMap::new(),
            start_time_ms: Some(now_ms()),
            end_time_ms: None,
        }
    }

    /// Last logged value of a metric
    pub fn last_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(|v| v.last()).map(|(v, _)| *v)
    }
}

/// Errors from experiment tracking operations
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run is not active: {0}")]
    RunNotActive(String),

    #[error("Tracker lock poisoned")]
    Poisoned,

    #[error("Storage error: {0}")]
    Storage(#[from] TrackingStorageError),
}

/// Result alias for tracking operations
pub type Result<T> = std::result::Result<T, TrackingError>;

/// Tracking toggle and parameters
///
/// Absent parameters disable tracking. Without `dir` runs are kept in
/// memory for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingParams {
    pub experiment: String,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TrackingParams {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            ..Self::default()
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }
}

/// Runs of one named experiment
pub struct ExperimentTracker {
    experiment_name: String,
    tags: BTreeMap<String, String>,
    backend: Box<dyn TrackingBackend + Send>,
    active_runs: BTreeMap<String, Run>,
    next_run_id: u64,
}

impl std::fmt::Debug for ExperimentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentTracker")
            .field("experiment_name", &self.experiment_name)
            .field("active_runs", &self.active_runs.len())
            .finish()
    }
}

impl ExperimentTracker {
    /// Create a tracker; run ids continue after those already stored
    pub fn new(
        experiment_name: impl Into<String>,
        backend: impl TrackingBackend + Send + 'static,
    ) -> Result<Self> {
        let stored = backend.list_runs()?.len() as u64;
        Ok(Self {
            experiment_name: experiment_name.into(),
            tags: BTreeMap::new(),
            backend: Box::new(backend),
            active_runs: BTreeMap::new(),
            next_run_id: stored + 1,
        })
    }

    /// Create a tracker with the backend selected by `params`
    pub fn from_params(params: &TrackingParams) -> Result<Self> {
        let mut tracker = match &params.dir {
            Some(dir) => Self::new(&params.experiment, JsonFileBackend::new(dir))?,
            None => Self::new(&params.experiment, InMemoryBackend::new())?,
        };
        for (k, v) in &params.tags {
            tracker.add_tag(k, v);
        }
        Ok(tracker)
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Start a run inheriting the experiment tags; returns its id
    pub fn start_run(&mut self, run_name: Option<&str>) -> String {
        let run_id = format!("run-{}", self.next_run_id);
        self.next_run_id += 1;
        let mut run = Run::new(
            run_id.clone(),
            run_name.map(String::from),
            self.experiment_name.clone(),
        );
        run.tags.extend(self.tags.clone());
        self.active_runs.insert(run_id.clone(), run);
        run_id
    }

    /// Close a run and persist it
    pub fn end_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut run = self
            .active_runs
            .remove(run_id)
            .ok_or_else(|| TrackingError::RunNotFound(run_id.to_string()))?;
        run.status = status;
        run.end_time_ms = Some(now_ms());
        self.backend.save_run(&run)?;
        Ok(())
    }

    fn active(&mut self, run_id: &str) -> Result<&mut Run> {
        self.active_runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::RunNotActive(run_id.to_string()))
    }

    pub fn log_param(&mut self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.active(run_id)?
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn log_metric(&mut self, run_id: &str, key: &str, value: f64, step: u64) -> Result<()> {
        self.active(run_id)?
            .metrics
            .entry(key.to_string())
            .or_default()
            .push((value, step));
        Ok(())
    }

    pub fn log_artifact(&mut self, run_id: &str, path: &str) -> Result<()> {
        self.active(run_id)?.artifacts.push(path.to_string());
        Ok(())
    }

    /// Active runs first, then the backend
    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        if let Some(run) = self.active_runs.get(run_id) {
            return Ok(run.clone());
        }
        self.backend
            .load_run(run_id)
            .map_err(|e| TrackingError::RunNotFound(format!("{run_id}: {e}")))
    }

    /// Active and persisted runs, ordered by id
    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.active_runs.values().cloned().collect();
        for r in self.backend.list_runs()? {
            if !self.active_runs.contains_key(&r.run_id) {
                runs.push(r);
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(runs)
    }
}

/// Shared handle to one open run
#[derive(Clone, Debug)]
pub struct RunHandle {
    tracker: Arc<Mutex<ExperimentTracker>>,
    run_id: String,
}

impl RunHandle {
    /// Open a run described by `params`
    pub fn start(params: &TrackingParams) -> Result<Self> {
        let mut tracker = ExperimentTracker::from_params(params)?;
        let run_id = tracker.start_run(params.run_name.as_deref());
        Ok(Self {
            tracker: Arc::new(Mutex::new(tracker)),
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn with<T>(&self, f: impl FnOnce(&mut ExperimentTracker, &str) -> Result<T>) -> Result<T> {
        let mut tracker = self.tracker.lock().map_err(|_| TrackingError::Poisoned)?;
        f(&mut tracker, &self.run_id)
    }

    pub fn log_param(&self, key: &str, value: &str) -> Result<()> {
        self.with(|t, id| t.log_param(id, key, value))
    }

    pub fn log_metric(&self, key: &str, value: f64, step: u64) -> Result<()> {
        self.with(|t, id| t.log_metric(id, key, value, step))
    }

    pub fn log_artifact(&self, path: &str) -> Result<()> {
        self.with(|t, id| t.log_artifact(id, path))
    }

    /// Snapshot of the run
    pub fn run(&self) -> Result<Run> {
        self.with(|t, id| t.get_run(id))
    }

    /// Close and persist the run
    pub fn finish(&self, status: RunStatus) -> Result<()> {
        self.with(|t, id| t.end_run(id, status))
    }
}
