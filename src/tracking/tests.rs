//! Tests for the tracking module

use super::storage::{InMemoryBackend, JsonFileBackend, TrackingBackend, TrackingStorageError};
use super::{ExperimentTracker, Run, RunHandle, RunStatus, TrackingError, TrackingParams};
use tempfile::TempDir;

#[test]
fn test_run_status_serde_roundtrip() {
    for status in [RunStatus::Active, RunStatus::Completed, RunStatus::Failed] {
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(serde_json::from_str::<RunStatus>(&json).unwrap(), status);
    }
}

#[test]
fn test_run_new_defaults() {
    let run = Run::new("run-1".into(), Some("qat".into()), "simplenet".into());
    assert_eq!(run.status, RunStatus::Active);
    assert!(run.params.is_empty());
    assert!(run.metrics.is_empty());
    assert!(run.start_time_ms.is_some());
    assert!(run.end_time_ms.is_none());
}

#[test]
fn test_last_metric() {
    let mut run = Run::new("run-1".into(), None, "exp".into());
    assert_eq!(run.last_metric("test_acc"), None);
    run.metrics
        .insert("test_acc".into(), vec![(40.0, 0), (55.5, 1)]);
    assert_eq!(run.last_metric("test_acc"), Some(55.5));
}

#[test]
fn test_tracker_inherits_tags_and_persists_on_end() {
    let mut tracker = ExperimentTracker::new("exp", InMemoryBackend::new()).unwrap();
    tracker.add_tag("backend", "fbgemm");
    let id = tracker.start_run(Some("static"));
    assert_eq!(id, "run-1");
    tracker.log_param(&id, "mode", "static").unwrap();
    tracker.log_metric(&id, "size_mb", 0.25, 0).unwrap();
    tracker.log_artifact(&id, "out/quantized_model.pth").unwrap();
    tracker.end_run(&id, RunStatus::Completed).unwrap();

    let run = tracker.get_run(&id).unwrap();
    assert_eq!(run.tags.get("backend").map(String::as_str), Some("fbgemm"));
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.end_time_ms.is_some());
    assert_eq!(run.artifacts, vec!["out/quantized_model.pth"]);
}

#[test]
fn test_logging_to_closed_run_fails() {
    let mut tracker = ExperimentTracker::new("exp", InMemoryBackend::new()).unwrap();
    let id = tracker.start_run(None);
    tracker.end_run(&id, RunStatus::Completed).unwrap();
    assert!(matches!(
        tracker.log_metric(&id, "loss", 1.0, 0),
        Err(TrackingError::RunNotActive(_))
    ));
    assert!(matches!(
        tracker.end_run(&id, RunStatus::Completed),
        Err(TrackingError::RunNotFound(_))
    ));
}

#[test]
fn test_json_backend_roundtrip_and_listing() {
    let dir = TempDir::new().unwrap();
    let mut backend = JsonFileBackend::new(dir.path().join("runs"));
    assert!(backend.list_runs().unwrap().is_empty());

    let mut run = Run::new("run-2".into(), None, "exp".into());
    run.metrics.insert("test_acc".into(), vec![(71.0, 3)]);
    backend.save_run(&run).unwrap();
    backend
        .save_run(&Run::new("run-1".into(), None, "exp".into()))
        .unwrap();

    assert_eq!(backend.load_run("run-2").unwrap().metrics, run.metrics);
    let ids: Vec<String> = backend.list_runs().unwrap().into_iter().map(|r| r.run_id).collect();
    assert_eq!(ids, vec!["run-1", "run-2"]);
    assert!(matches!(
        backend.load_run("run-9"),
        Err(TrackingStorageError::RunNotFound(_))
    ));
}

#[test]
fn test_run_ids_continue_after_stored_runs() {
    let dir = TempDir::new().unwrap();
    let params = TrackingParams::new("exp").with_dir(dir.path());
    let first = RunHandle::start(&params).unwrap();
    first.finish(RunStatus::Completed).unwrap();
    let second = RunHandle::start(&params).unwrap();
    assert_eq!(first.run_id(), "run-1");
    assert_eq!(second.run_id(), "run-2");
}

#[test]
fn test_run_handle_clones_share_the_run() {
    let handle = RunHandle::start(&TrackingParams::new("exp").with_run_name("qat")).unwrap();
    let other = handle.clone();
    handle.log_metric("train_loss", 0.9, 0).unwrap();
    other.log_metric("train_loss", 0.7, 1).unwrap();
    other.log_param("backend", "qnnpack").unwrap();

    let run = handle.run().unwrap();
    assert_eq!(run.run_name.as_deref(), Some("qat"));
    assert_eq!(run.metrics["train_loss"], vec![(0.9, 0), (0.7, 1)]);
    assert_eq!(run.params["backend"], "qnnpack");
}

#[test]
fn test_params_deserialize_with_defaults() {
    let params: TrackingParams = serde_yaml::from_str("experiment: sweep\n").unwrap();
    assert_eq!(params, TrackingParams::new("sweep"));
}
