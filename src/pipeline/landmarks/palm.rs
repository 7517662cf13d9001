use std::{cmp::Ordering, f32::consts::PI, path::Path, sync::OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::preprocess::{Letterbox, PALM_INPUT_SIZE, letterbox};
use crate::types::{Frame, PalmRegion};

const PALM_LANDMARKS: usize = 7;
const BOX_FEATURES: usize = 4 + PALM_LANDMARKS * 2;

// SSD layout of the 192x192 MediaPipe palm detector: consecutive layers with
// the same stride share one grid, two anchors per layer and cell.
const ANCHOR_STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;

/// Anchor centres in normalized input coordinates.
pub fn generate_anchors(input_size: u32) -> Vec<[f32; 2]> {
    let mut anchors = Vec::new();
    let mut layer = 0;
    while layer < ANCHOR_STRIDES.len() {
        let stride = ANCHOR_STRIDES[layer];
        let mut per_cell = 0;
        while layer < ANCHOR_STRIDES.len() && ANCHOR_STRIDES[layer] == stride {
            per_cell += ANCHORS_PER_LAYER;
            layer += 1;
        }
        let grid = input_size.div_ceil(stride);
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + 0.5) / grid as f32;
                let cy = (y as f32 + 0.5) / grid as f32;
                anchors.extend(std::iter::repeat_n([cx, cy], per_cell));
            }
        }
    }
    anchors
}

fn anchors() -> &'static [[f32; 2]] {
    static ANCHORS: OnceLock<Vec<[f32; 2]>> = OnceLock::new();
    ANCHORS.get_or_init(|| generate_anchors(PALM_INPUT_SIZE))
}

#[derive(Clone, Debug)]
pub struct PalmDetectorConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub top_k: usize,
}

impl Default for PalmDetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.3,
            top_k: 32,
        }
    }
}

pub struct PalmDetector {
    session: Session,
    cfg: PalmDetectorConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, cfg: PalmDetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load palm detector from {}", model_path.display()))?;

        Ok(Self { session, cfg })
    }

    /// Palms sorted by descending score.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = letterbox(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run palm detector session")?;
        if outputs.len() < 2 {
            bail!(
                "palm detector returned {} outputs, expected at least 2",
                outputs.len()
            );
        }

        let boxes = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        decode_palm_outputs(
            boxes
                .as_slice()
                .ok_or_else(|| anyhow!("palm boxes not contiguous"))?,
            scores
                .as_slice()
                .ok_or_else(|| anyhow!("palm scores not contiguous"))?,
            &letterbox,
            &self.cfg,
        )
    }
}

/// `boxes` is `[anchors, 18]` (box centre/size then 7 palm keypoints, in input
/// pixels relative to the anchor), `scores` is `[anchors, 1]` logits.
fn decode_palm_outputs(
    boxes: &[f32],
    scores: &[f32],
    letterbox: &Letterbox,
    cfg: &PalmDetectorConfig,
) -> Result<Vec<PalmRegion>> {
    let anchors = anchors();
    if boxes.len() % BOX_FEATURES != 0 {
        bail!("palm box tensor length {} is not a multiple of {BOX_FEATURES}", boxes.len());
    }
    let count = (boxes.len() / BOX_FEATURES).min(scores.len()).min(anchors.len());
    let input = PALM_INPUT_SIZE as f32;
    let to_frame = |anchor: [f32; 2], dx: f32, dy: f32| {
        letterbox.to_source((dx / input + anchor[0]) * input, (dy / input + anchor[1]) * input)
    };

    let mut candidates = Vec::new();
    for idx in 0..count {
        let score = sigmoid(scores[idx]);
        if score < cfg.score_threshold {
            continue;
        }
        let row = &boxes[idx * BOX_FEATURES..(idx + 1) * BOX_FEATURES];
        let anchor = anchors[idx];

        let (x1, y1) = to_frame(anchor, row[0] - row[2] / 2.0, row[1] - row[3] / 2.0);
        let (x2, y2) = to_frame(anchor, row[0] + row[2] / 2.0, row[1] + row[3] / 2.0);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        let max_w = letterbox.orig_w.saturating_sub(1) as f32;
        let max_h = letterbox.orig_h.saturating_sub(1) as f32;
        let bbox = [
            x1.clamp(0.0, max_w),
            y1.clamp(0.0, max_h),
            x2.clamp(0.0, max_w),
            y2.clamp(0.0, max_h),
        ];

        let landmarks = row[4..]
            .chunks_exact(2)
            .map(|p| to_frame(anchor, p[0], p[1]))
            .collect();

        candidates.push(PalmRegion {
            bbox,
            landmarks,
            score,
        });
    }

    let kept = nms(&candidates, cfg.nms_threshold, cfg.top_k);
    Ok(kept.into_iter().map(|idx| candidates[idx].clone()).collect())
}

/// Square crop (centre, side, rotation) that contains the whole hand.
pub fn crop_from_palm(region: &PalmRegion) -> ((f32, f32), f32, f32) {
    let center = if region.landmarks.is_empty() {
        (
            (region.bbox[0] + region.bbox[2]) * 0.5,
            (region.bbox[1] + region.bbox[3]) * 0.5,
        )
    } else {
        let n = region.landmarks.len() as f32;
        let (sx, sy) = region
            .landmarks
            .iter()
            .fold((0.0f32, 0.0f32), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };

    let base = (region.bbox[2] - region.bbox[0])
        .abs()
        .max((region.bbox[3] - region.bbox[1]).abs());
    let span = region
        .landmarks
        .iter()
        .fold(None, |acc: Option<(f32, f32, f32, f32)>, (x, y)| {
            Some(match acc {
                None => (*x, *x, *y, *y),
                Some((a, b, c, d)) => (a.min(*x), b.max(*x), c.min(*y), d.max(*y)),
            })
        })
        .map(|(min_x, max_x, min_y, max_y)| (max_x - min_x).max(max_y - min_y))
        .unwrap_or(0.0);
    // The palm box covers the palm only; fingers need a much larger crop.
    let side = base.max(span).max(80.0) * 2.4;

    (center, side, estimate_orientation(region))
}

/// Principal axis of the palm keypoints, rotated so the fingers point up.
pub fn estimate_orientation(region: &PalmRegion) -> f32 {
    let n = region.landmarks.len();
    if n < 2 {
        return 0.0;
    }
    let (sx, sy) = region
        .landmarks
        .iter()
        .fold((0.0f32, 0.0f32), |acc, (x, y)| (acc.0 + x, acc.1 + y));
    let mean = (sx / n as f32, sy / n as f32);

    let (mut cxx, mut cxy, mut cyy) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in &region.landmarks {
        let dx = x - mean.0;
        let dy = y - mean.1;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
    }
    cxx /= n as f32;
    cxy /= n as f32;
    cyy /= n as f32;

    let half_trace = (cxx + cyy) * 0.5;
    let det = cxx * cyy - cxy * cxy;
    let lambda = (half_trace + (half_trace * half_trace - det).max(0.0).sqrt()).max(1e-6);
    let (vx, vy) = if cxy.abs() > 1e-6 {
        (lambda - cyy, cxy)
    } else if cxx >= cyy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };

    vy.atan2(vx) - PI * 0.5
}

fn nms(candidates: &[PalmRegion], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    for idx in order {
        if keep
            .iter()
            .any(|k| iou(&candidates[idx].bbox, &candidates[*k].bbox) >= threshold)
        {
            continue;
        }
        keep.push(idx);
        if keep.len() >= top_k {
            break;
        }
    }
    keep
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
