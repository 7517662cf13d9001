#![allow(dead_code)]

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use asl_translator::classes::ClassMapping;
use asl_translator::pipeline::{HandTracker, LoadedModel, SignClassifier};
use asl_translator::tts::{AudioPlayer, Playback, Synthesizer};
use asl_translator::types::{Frame, HandLandmarks, Handedness, LandmarkVector, NUM_LANDMARKS};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageFormat, RgbImage};

/// Reports one hand while `present` is set.
pub struct SwitchTracker {
    pub present: Arc<AtomicBool>,
}

impl SwitchTracker {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let present = Arc::new(AtomicBool::new(true));
        (
            Self {
                present: Arc::clone(&present),
            },
            present,
        )
    }
}

impl HandTracker for SwitchTracker {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<HandLandmarks>> {
        if self.present.load(Ordering::SeqCst) {
            Ok(vec![hand()])
        } else {
            Ok(Vec::new())
        }
    }
}

pub fn hand() -> HandLandmarks {
    let mut points = [[0.0; 3]; NUM_LANDMARKS];
    for (i, p) in points.iter_mut().enumerate() {
        *p = [0.3 + i as f32 * 0.01, 0.6 - i as f32 * 0.01, -0.01 * i as f32];
    }
    HandLandmarks {
        points,
        score: 0.95,
        handedness: Handedness::Right,
    }
}

pub struct FixedClassifier(pub Vec<f32>);

impl SignClassifier for FixedClassifier {
    fn predict(&mut self, _input: &LandmarkVector) -> Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

/// `hello` at 0.9 under the default mapping.
pub fn hello_probabilities() -> Vec<f32> {
    vec![0.02, 0.9, 0.02, 0.02, 0.02, 0.02]
}

pub fn model(probabilities: Vec<f32>) -> LoadedModel {
    LoadedModel {
        classifier: Box::new(FixedClassifier(probabilities)),
        path: PathBuf::from("models/final_asl_model_test.onnx"),
        mapping: ClassMapping::default(),
    }
}

/// Writes the text itself as the "audio".
pub struct TextFileSynth;

impl Synthesizer for TextFileSynth {
    fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
        fs::write(dest, text)?;
        Ok(())
    }
}

pub struct FailingSynth;

impl Synthesizer for FailingSynth {
    fn synthesize(&self, _text: &str, _dest: &Path) -> Result<()> {
        Err(anyhow!("network unreachable"))
    }
}

/// Playback that stays busy until `release` is set.
pub struct HeldPlayer {
    pub release: Arc<AtomicBool>,
}

struct HeldPlayback {
    release: Arc<AtomicBool>,
}

impl Playback for HeldPlayback {
    fn is_busy(&mut self) -> bool {
        !self.release.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {}
}

impl AudioPlayer for HeldPlayer {
    fn play(&self, path: &Path) -> Result<Box<dyn Playback>> {
        if !path.is_file() {
            return Err(anyhow!("missing audio file {path:?}"));
        }
        Ok(Box::new(HeldPlayback {
            release: Arc::clone(&self.release),
        }))
    }
}

pub fn png_base64(width: u32, height: u32) -> String {
    let image = RgbImage::from_pixel(width, height, image::Rgb([120, 80, 40]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes)
}
