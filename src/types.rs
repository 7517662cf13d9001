use std::time::Instant;

use rayon::prelude::*;

use crate::error::LandmarkError;

pub const NUM_LANDMARKS: usize = 21;
pub const LANDMARK_DIMS: usize = 3;
pub const FEATURE_LEN: usize = NUM_LANDMARKS * LANDMARK_DIMS;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    /// Opaque black frame, used to verify freshly built trackers.
    pub fn blank(width: u32, height: u32) -> Self {
        let mut rgba = vec![0u8; width as usize * height as usize * 4];
        for px in rgba.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self::new(rgba, width, height)
    }

    /// Horizontally flipped copy, the orientation users expect from a webcam preview.
    pub fn mirrored(&self) -> Self {
        let row_bytes = self.width as usize * 4;
        let mut rgba = self.rgba.clone();
        if row_bytes > 0 {
            rgba.par_chunks_mut(row_bytes).for_each(|row| {
                let pixels = row.len() / 4;
                for x in 0..pixels / 2 {
                    let left = x * 4;
                    let right = (pixels - 1 - x) * 4;
                    for c in 0..4 {
                        row.swap(left + c, right + c);
                    }
                }
            });
        }
        Self {
            rgba,
            width: self.width,
            height: self.height,
            timestamp: self.timestamp,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Fixed-length classifier input: 21 landmarks × (x, y, z).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LandmarkVector([f32; FEATURE_LEN]);

impl LandmarkVector {
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_LEN])
    }

    /// Zero-pads shorter input and truncates longer input to 63 values.
    pub fn from_slice_padded(values: &[f32]) -> Self {
        let mut data = [0.0; FEATURE_LEN];
        let n = values.len().min(FEATURE_LEN);
        data[..n].copy_from_slice(&values[..n]);
        Self(data)
    }

    /// Like [`LandmarkVector::from_slice_padded`] but rejects empty or non-finite input.
    pub fn try_from_values(values: &[f32]) -> Result<Self, LandmarkError> {
        if values.is_empty() {
            return Err(LandmarkError::Empty);
        }
        if let Some((index, value)) = values
            .iter()
            .take(FEATURE_LEN)
            .enumerate()
            .find(|(_, v)| !v.is_finite())
        {
            return Err(LandmarkError::NonFinite {
                index,
                value: *value,
            });
        }
        Ok(Self::from_slice_padded(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
    Unknown,
}

impl Handedness {
    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "Left",
            Handedness::Right => "Right",
            Handedness::Unknown => "Unknown",
        }
    }
}

/// One tracked hand. Coordinates are normalized to the frame: x, y in [0, 1],
/// z relative to the wrist and scaled by frame width.
#[derive(Clone, Debug, PartialEq)]
pub struct HandLandmarks {
    pub points: [[f32; 3]; NUM_LANDMARKS],
    pub score: f32,
    pub handedness: Handedness,
}

impl HandLandmarks {
    pub fn to_vector(&self) -> Result<LandmarkVector, LandmarkError> {
        let flat: Vec<f32> = self.points.iter().flatten().copied().collect();
        LandmarkVector::try_from_values(&flat)
    }

    /// Landmarks as seen in a horizontally flipped image.
    pub fn mirrored(&self) -> Self {
        let mut points = self.points;
        for p in points.iter_mut() {
            p[0] = 1.0 - p[0];
        }
        let handedness = match self.handedness {
            Handedness::Left => Handedness::Right,
            Handedness::Right => Handedness::Left,
            Handedness::Unknown => Handedness::Unknown,
        };
        Self {
            points,
            score: self.score,
            handedness,
        }
    }

    pub fn pixel_points(&self, width: u32, height: u32) -> Vec<(f32, f32)> {
        self.points
            .iter()
            .map(|p| (p[0] * width as f32, p[1] * height as f32))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Arg-max over a distribution. `None` for an empty distribution.
    pub fn from_probabilities(probabilities: Vec<f32>, label: impl Fn(usize) -> String) -> Option<Self> {
        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (idx, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((idx, p)),
            })?;
        Some(Self {
            class_index,
            label: label(class_index),
            confidence,
            probabilities,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PalmRegion {
    pub bbox: [f32; 4],
    pub landmarks: Vec<(f32, f32)>,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_zero_padded() {
        let v = LandmarkVector::from_slice_padded(&[1.0, 2.0, 3.0]);
        assert_eq!(v.as_slice().len(), FEATURE_LEN);
        assert_eq!(&v.as_slice()[..3], &[1.0, 2.0, 3.0]);
        assert!(v.as_slice()[3..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn long_input_is_truncated() {
        let values: Vec<f32> = (0..80).map(|i| i as f32).collect();
        let v = LandmarkVector::from_slice_padded(&values);
        assert_eq!(v.as_slice().len(), FEATURE_LEN);
        assert_eq!(v.as_slice()[62], 62.0);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut values = vec![0.5; FEATURE_LEN];
        values[7] = f32::NAN;
        assert!(matches!(
            LandmarkVector::try_from_values(&values),
            Err(LandmarkError::NonFinite { index: 7, .. })
        ));
        assert_eq!(LandmarkVector::try_from_values(&[]), Err(LandmarkError::Empty));
    }

    #[test]
    fn mirroring_flips_x_and_handedness() {
        let mut points = [[0.0f32; 3]; NUM_LANDMARKS];
        points[0] = [0.25, 0.5, -0.1];
        let hand = HandLandmarks {
            points,
            score: 0.9,
            handedness: Handedness::Left,
        };
        let mirrored = hand.mirrored();
        assert_eq!(mirrored.points[0], [0.75, 0.5, -0.1]);
        assert_eq!(mirrored.handedness, Handedness::Right);
    }

    #[test]
    fn frame_mirror_swaps_columns() {
        let frame = Frame::new(vec![1, 1, 1, 255, 2, 2, 2, 255, 3, 3, 3, 255], 3, 1);
        let mirrored = frame.mirrored();
        assert_eq!(mirrored.rgba, vec![3, 3, 3, 255, 2, 2, 2, 255, 1, 1, 1, 255]);
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        let p = Prediction::from_probabilities(vec![0.1, 0.45, 0.45], |i| format!("c{i}")).unwrap();
        assert_eq!(p.class_index, 1);
        assert_eq!(p.label, "c1");
        assert!(Prediction::from_probabilities(Vec::new(), |i| i.to_string()).is_none());
    }
}
