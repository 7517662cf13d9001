use std::fmt;
use std::time::Instant;

use crate::pipeline::classifier::LoadedModel;
use crate::pipeline::landmarks::HandTracker;
use crate::smoothing::{SmootherConfig, TemporalSmoother};
use crate::types::{Frame, HandLandmarks};

#[derive(Clone, Debug, PartialEq)]
pub enum RecognitionStatus {
    /// A smoothed sign.
    Sign { label: String },
    /// No hand in view; `held` is the decayed previous sign, if any.
    NoHand { held: Option<String> },
    LowConfidence,
    UnknownSign,
    ModelNotLoaded,
    TrackerUnavailable,
    LandmarkProcessingFailed,
    PredictionError,
}

impl RecognitionStatus {
    pub fn label(&self) -> Option<&str> {
        match self {
            RecognitionStatus::Sign { label } => Some(label),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RecognitionStatus::TrackerUnavailable
                | RecognitionStatus::LandmarkProcessingFailed
                | RecognitionStatus::PredictionError
        )
    }
}

impl fmt::Display for RecognitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionStatus::Sign { label } => f.write_str(label),
            RecognitionStatus::NoHand { .. } => f.write_str("No hand detected"),
            RecognitionStatus::LowConfidence => f.write_str("Low confidence"),
            RecognitionStatus::UnknownSign => f.write_str("Unknown sign"),
            RecognitionStatus::ModelNotLoaded => f.write_str("Model not loaded"),
            RecognitionStatus::TrackerUnavailable => f.write_str("Hand tracker not initialized"),
            RecognitionStatus::LandmarkProcessingFailed => f.write_str("Landmark processing failed"),
            RecognitionStatus::PredictionError => f.write_str("Prediction error"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub status: RecognitionStatus,
    /// Smoothed confidence for signs, decayed confidence for a held sign,
    /// raw confidence otherwise.
    pub confidence: f32,
    pub raw_confidence: f32,
    pub hands: Vec<HandLandmarks>,
    /// Whether this frame went through the smoother and produced a sign.
    pub smoothed: bool,
}

impl FrameOutcome {
    pub fn status_only(status: RecognitionStatus) -> Self {
        Self {
            status,
            confidence: 0.0,
            raw_confidence: 0.0,
            hands: Vec::new(),
            smoothed: false,
        }
    }

    pub fn hand_detected(&self) -> bool {
        !self.hands.is_empty()
    }
}

/// Turns tracked hands into a status. `gate` is the minimum raw confidence a
/// prediction needs before it enters the smoother; without a gate every
/// prediction is smoothed.
pub fn outcome_for_hands(
    hands: Vec<HandLandmarks>,
    model: Option<&mut LoadedModel>,
    smoother: &mut TemporalSmoother<usize>,
    gate: Option<f32>,
    now: Instant,
) -> FrameOutcome {
    let Some(hand) = hands.first() else {
        let held = smoother.observe_at(None, 0.0, now);
        let label = held
            .label
            .and_then(|idx| model.as_ref().and_then(|m| m.mapping.name(idx)).map(str::to_string));
        return FrameOutcome {
            confidence: if label.is_some() { held.confidence } else { 0.0 },
            status: RecognitionStatus::NoHand { held: label },
            raw_confidence: 0.0,
            hands,
            smoothed: false,
        };
    };

    let vector = match hand.to_vector() {
        Ok(vector) => vector,
        Err(err) => {
            log::warn!("landmark processing failed: {err}");
            return FrameOutcome {
                hands,
                ..FrameOutcome::status_only(RecognitionStatus::LandmarkProcessingFailed)
            };
        }
    };

    let Some(model) = model else {
        return FrameOutcome {
            hands,
            ..FrameOutcome::status_only(RecognitionStatus::ModelNotLoaded)
        };
    };

    let prediction = match model.predict(&vector) {
        Ok(prediction) => prediction,
        Err(err) => {
            log::warn!("prediction failed: {err:?}");
            return FrameOutcome {
                hands,
                ..FrameOutcome::status_only(RecognitionStatus::PredictionError)
            };
        }
    };
    let raw = prediction.confidence;

    if model.mapping.name(prediction.class_index).is_none() {
        return FrameOutcome {
            status: RecognitionStatus::UnknownSign,
            confidence: raw,
            raw_confidence: raw,
            hands,
            smoothed: false,
        };
    }

    if gate.is_some_and(|threshold| raw <= threshold) {
        return FrameOutcome {
            status: RecognitionStatus::LowConfidence,
            confidence: raw,
            raw_confidence: raw,
            hands,
            smoothed: false,
        };
    }

    let smoothed = smoother.observe_at(Some(prediction.class_index), raw, now);
    let label = smoothed
        .label
        .and_then(|idx| model.mapping.name(idx))
        .map(str::to_string);
    match label {
        Some(label) => FrameOutcome {
            status: RecognitionStatus::Sign { label },
            confidence: smoothed.confidence,
            raw_confidence: raw,
            hands,
            smoothed: true,
        },
        None => FrameOutcome {
            status: RecognitionStatus::UnknownSign,
            confidence: raw,
            raw_confidence: raw,
            hands,
            smoothed: false,
        },
    }
}

/// Tracker, classifier and smoother owned by a single thread.
pub struct Recognizer {
    tracker: Option<Box<dyn HandTracker>>,
    model: Option<LoadedModel>,
    smoother: TemporalSmoother<usize>,
    gate: Option<f32>,
}

impl Recognizer {
    pub fn new(
        tracker: Option<Box<dyn HandTracker>>,
        model: Option<LoadedModel>,
        smoothing: SmootherConfig,
        gate: Option<f32>,
    ) -> Self {
        Self {
            tracker,
            model,
            smoother: TemporalSmoother::new(smoothing),
            gate,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> FrameOutcome {
        self.process_at(frame, Instant::now())
    }

    pub fn process_at(&mut self, frame: &Frame, now: Instant) -> FrameOutcome {
        if self.tracker.is_none() {
            return FrameOutcome::status_only(RecognitionStatus::TrackerUnavailable);
        }
        let hands = self.detect(frame);
        outcome_for_hands(hands, self.model.as_mut(), &mut self.smoother, self.gate, now)
    }

    /// Hands only, for data collection. Tracker failures count as no hand.
    pub fn detect(&mut self, frame: &Frame) -> Vec<HandLandmarks> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Vec::new();
        };
        tracker.detect(frame).unwrap_or_else(|err| {
            log::warn!("hand tracking failed: {err:?}");
            Vec::new()
        })
    }

    pub fn clear_history(&mut self) {
        self.smoother.clear();
    }

    pub fn history_len(&self) -> usize {
        self.smoother.len()
    }

    pub fn tracker_ready(&self) -> bool {
        self.tracker.is_some()
    }

    pub fn model(&self) -> Option<&LoadedModel> {
        self.model.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassMapping;
    use crate::pipeline::classifier::SignClassifier;
    use crate::types::{Handedness, LandmarkVector, NUM_LANDMARKS};
    use anyhow::{Result, anyhow};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Scripted(Vec<f32>);

    impl SignClassifier for Scripted {
        fn predict(&mut self, _input: &LandmarkVector) -> Result<Vec<f32>> {
            if self.0.is_empty() { Err(anyhow!("broken")) } else { Ok(self.0.clone()) }
        }
    }

    fn model(probabilities: Vec<f32>) -> LoadedModel {
        LoadedModel {
            classifier: Box::new(Scripted(probabilities)),
            path: PathBuf::from("test.onnx"),
            mapping: ClassMapping::default(),
        }
    }

    fn hand() -> HandLandmarks {
        HandLandmarks {
            points: [[0.5, 0.5, 0.0]; NUM_LANDMARKS],
            score: 0.9,
            handedness: Handedness::Right,
        }
    }

    fn hello() -> Vec<f32> {
        vec![0.02, 0.9, 0.02, 0.02, 0.02, 0.02]
    }

    #[test]
    fn five_hello_frames_are_stable() {
        let mut m = model(hello());
        let mut s = TemporalSmoother::new(SmootherConfig::desktop());
        let t0 = Instant::now();
        for i in 0..5 {
            let out = outcome_for_hands(vec![hand()], Some(&mut m), &mut s, None, t0 + Duration::from_millis(i * 30));
            assert_eq!(out.status, RecognitionStatus::Sign { label: "hello".into() });
            assert!((out.confidence - 0.9).abs() < 1e-5);
            assert!(out.smoothed);
        }
    }

    #[test]
    fn missing_hand_holds_the_previous_sign() {
        let mut m = model(hello());
        let mut s = TemporalSmoother::new(SmootherConfig::desktop());
        let t0 = Instant::now();
        for i in 0..3 {
            outcome_for_hands(vec![hand()], Some(&mut m), &mut s, None, t0 + Duration::from_millis(i * 30));
        }
        let out = outcome_for_hands(Vec::new(), Some(&mut m), &mut s, None, t0 + Duration::from_millis(120));
        assert_eq!(out.status, RecognitionStatus::NoHand { held: Some("hello".into()) });
        assert!((out.confidence - 0.81).abs() < 1e-5);
        assert!(!out.hand_detected());
    }

    #[test]
    fn gate_keeps_low_confidence_out_of_history() {
        let mut m = model(vec![0.5, 0.1, 0.1, 0.1, 0.1, 0.1]);
        let mut s = TemporalSmoother::new(SmootherConfig::web(3));
        let out = outcome_for_hands(vec![hand()], Some(&mut m), &mut s, Some(0.7), Instant::now());
        assert_eq!(out.status, RecognitionStatus::LowConfidence);
        assert_eq!(out.status.to_string(), "Low confidence");
        assert!(s.is_empty());
    }

    #[test]
    fn class_outside_mapping_is_unknown() {
        let mut probs = vec![0.0; 7];
        probs[6] = 1.0;
        let mut m = model(probs);
        let mut s = TemporalSmoother::new(SmootherConfig::desktop());
        let out = outcome_for_hands(vec![hand()], Some(&mut m), &mut s, None, Instant::now());
        assert_eq!(out.status, RecognitionStatus::UnknownSign);
    }

    #[test]
    fn errors_map_to_statuses() {
        let mut s = TemporalSmoother::new(SmootherConfig::desktop());
        let out = outcome_for_hands(vec![hand()], None, &mut s, None, Instant::now());
        assert_eq!(out.status, RecognitionStatus::ModelNotLoaded);

        let mut broken = model(Vec::new());
        let out = outcome_for_hands(vec![hand()], Some(&mut broken), &mut s, None, Instant::now());
        assert_eq!(out.status, RecognitionStatus::PredictionError);

        let mut bad = hand();
        bad.points[3][1] = f32::INFINITY;
        let mut m = model(hello());
        let out = outcome_for_hands(vec![bad], Some(&mut m), &mut s, None, Instant::now());
        assert_eq!(out.status, RecognitionStatus::LandmarkProcessingFailed);

        let mut r = Recognizer::new(None, Some(model(hello())), SmootherConfig::desktop(), None);
        assert_eq!(r.process(&Frame::blank(8, 8)).status, RecognitionStatus::TrackerUnavailable);
    }
}
