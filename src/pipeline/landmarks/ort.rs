use anyhow::{Context, Result};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::HandTracker;
use super::palm::{PalmDetector, PalmDetectorConfig, crop_from_palm};
use super::preprocess::{self, HANDPOSE_INPUT_SIZE};
use crate::config::TrackerConfig;
use crate::types::{Frame, HandLandmarks, Handedness};

/// Two-stage MediaPipe tracker: palm detection, then 21-point hand landmarks
/// on a rotated crop around each palm.
pub struct OrtHandTracker {
    handpose: Session,
    palm_detector: PalmDetector,
    max_hands: usize,
    min_tracking_confidence: f32,
}

impl OrtHandTracker {
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let handpose = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&config.handpose_model)
            .with_context(|| {
                format!(
                    "failed to load hand landmark model from {}",
                    config.handpose_model.display()
                )
            })?;

        let palm_detector = PalmDetector::new(
            &config.palm_model,
            PalmDetectorConfig {
                score_threshold: config.min_detection_confidence,
                ..PalmDetectorConfig::default()
            },
        )?;

        log::info!(
            "hand tracker ready using {} and {}",
            config.palm_model.display(),
            config.handpose_model.display()
        );
        Ok(Self {
            handpose,
            palm_detector,
            max_hands: config.max_hands.max(1),
            min_tracking_confidence: config.min_tracking_confidence,
        })
    }
}

struct HandposeRaw {
    points: Vec<f32>,
    presence: f32,
    handedness: f32,
}

impl OrtHandTracker {
    fn run_handpose(&mut self, input: ndarray::Array4<f32>) -> Result<HandposeRaw> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .handpose
            .run(ort::inputs![tensor])
            .context("failed to run hand landmark session")?;
        if outputs.len() < 1 {
            anyhow::bail!("hand landmark model returned no outputs");
        }

        let scalar = |idx: usize| {
            if outputs.len() <= idx {
                return 0.0;
            }
            outputs[idx]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
                .unwrap_or(0.0)
        };

        let points = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        Ok(HandposeRaw {
            points,
            presence: scalar(1),
            handedness: scalar(2),
        })
    }
}

impl HandTracker for OrtHandTracker {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<HandLandmarks>> {
        let palms = self.palm_detector.detect(frame)?;

        let mut hands = Vec::new();
        for palm in palms.iter().take(self.max_hands) {
            let (center, side, angle) = crop_from_palm(palm);
            let (input, transform) =
                preprocess::prepare_rotated_crop(frame, center, side, angle, HANDPOSE_INPUT_SIZE)?;
            let raw = self.run_handpose(input)?;
            if raw.presence < self.min_tracking_confidence {
                log::trace!("dropping hand with presence {:.2}", raw.presence);
                continue;
            }

            let crop_points = preprocess::decode_landmarks(&raw.points)?;
            let points = crop_points.map(|p| transform.normalize(p));
            hands.push(HandLandmarks {
                points,
                score: (raw.presence * palm.score).clamp(0.0, 1.0),
                handedness: if raw.handedness > 0.5 {
                    Handedness::Right
                } else {
                    Handedness::Left
                },
            });
        }
        Ok(hands)
    }
}
