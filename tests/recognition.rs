mod common;

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use asl_translator::config::ModelConfig;
use asl_translator::pipeline::{ModelSearch, RecognitionStatus, Recognizer, SignClassifier};
use asl_translator::smoothing::{SmootherConfig, TemporalSmoother};
use asl_translator::types::{Frame, LandmarkVector};

use common::{FixedClassifier, SwitchTracker, hello_probabilities, model};

#[test]
fn smoother_scenarios() {
    let mut smoother = TemporalSmoother::new(SmootherConfig::desktop());
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);

    // Below three observations the input comes back unchanged.
    let first = smoother.observe_at(Some("A"), 0.6, at(0));
    assert_eq!((first.label, first.confidence), (Some("A"), 0.6));
    let second = smoother.observe_at(Some("B"), 0.4, at(30));
    assert_eq!((second.label, second.confidence), (Some("B"), 0.4));

    let third = smoother.observe_at(Some("A"), 0.8, at(60));
    assert_eq!(third.label, Some("A"));
    assert!((third.confidence - 0.7).abs() < 1e-6);

    let held = smoother.observe_at(None, 0.0, at(90));
    assert_eq!(held.label, Some("A"));
    assert!((held.confidence - 0.72).abs() < 1e-6);

    // Nothing seen for longer than the max age.
    let gone = smoother.observe_at(None, 0.0, at(5_000));
    assert_eq!(gone.label, None);
    assert!(smoother.is_empty());
}

#[test]
fn desktop_recognizer_stabilises_on_hello() {
    let (tracker, hand) = SwitchTracker::new();
    let mut recognizer = Recognizer::new(
        Some(Box::new(tracker)),
        Some(model(hello_probabilities())),
        SmootherConfig::desktop(),
        None,
    );
    let frame = Frame::blank(64, 48);
    let t0 = Instant::now();
    for i in 0..5 {
        let outcome = recognizer.process_at(&frame, t0 + Duration::from_millis(i * 33));
        assert_eq!(outcome.status, RecognitionStatus::Sign { label: "hello".into() });
        assert!((outcome.confidence - 0.9).abs() < 1e-5);
    }

    hand.store(false, std::sync::atomic::Ordering::SeqCst);
    let outcome = recognizer.process_at(&frame, t0 + Duration::from_millis(200));
    assert_eq!(outcome.status, RecognitionStatus::NoHand { held: Some("hello".into()) });
    assert!((outcome.confidence - 0.81).abs() < 1e-5);
    assert!(!outcome.hand_detected());
}

#[test]
fn recognizer_without_parts_reports_why() {
    let frame = Frame::blank(16, 16);
    let mut no_tracker = Recognizer::new(None, Some(model(hello_probabilities())), SmootherConfig::desktop(), None);
    assert_eq!(no_tracker.process(&frame).status, RecognitionStatus::TrackerUnavailable);

    let (tracker, _) = SwitchTracker::new();
    let mut no_model = Recognizer::new(Some(Box::new(tracker)), None, SmootherConfig::desktop(), None);
    let outcome = no_model.process(&frame);
    assert_eq!(outcome.status, RecognitionStatus::ModelNotLoaded);
    assert!(outcome.hand_detected());
}

fn touch(dir: &Path, name: &str) {
    fs::write(dir.join(name), b"onnx").unwrap();
}

fn fixed_loader(path: &Path) -> anyhow::Result<Box<dyn SignClassifier>> {
    assert!(path.is_file());
    Ok(Box::new(FixedClassifier(hello_probabilities())))
}

fn search(dir: &Path) -> ModelSearch {
    ModelSearch::from(&ModelConfig {
        search_dirs: vec![dir.to_path_buf()],
        ..ModelConfig::default()
    })
}

#[test]
fn single_candidate_in_a_tier_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "asl_model_20240101.onnx");
    touch(dir.path(), "palm_detection_mediapipe_2023feb.onnx");

    let loaded = search(dir.path()).load(fixed_loader).unwrap();
    assert_eq!(loaded.path, dir.path().join("asl_model_20240101.onnx"));
    assert_eq!(loaded.mapping.names().len(), 6);
}

#[test]
fn higher_tiers_win_and_mapping_is_read() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "model_a.onnx");
    touch(dir.path(), "final_asl_model_1.onnx");
    touch(dir.path(), "final_asl_model_2.onnx");
    fs::write(dir.path().join("class_mapping.json"), r#"{"0": "yes", "1": "no"}"#).unwrap();

    let search = search(dir.path());
    let candidates = search.candidates();
    assert_eq!(candidates[0], dir.path().join("final_asl_model_2.onnx"));
    assert_eq!(candidates.last(), Some(&dir.path().join("model_a.onnx")));

    let mut loaded = search.load(fixed_loader).unwrap();
    assert_eq!(loaded.mapping.names(), ["yes", "no"]);
    // Class 1 of six probabilities maps to "no" under this mapping.
    let prediction = loaded.predict(&LandmarkVector::zeros()).unwrap();
    assert_eq!(prediction.label, "no");
}

#[test]
fn empty_directory_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let Err(err) = search(dir.path()).load(fixed_loader) else {
        panic!("an empty directory produced a model");
    };
    assert_eq!(err.what(), "sign classifier");
}
