use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use image::{DynamicImage, RgbaImage};

use super::{DatasetLayout, write_landmark_file};
use crate::pipeline::skeleton::{Canvas, centered_square, draw_hand};
use crate::types::{Frame, HandLandmarks};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectMode {
    /// Centre crops of the raw frame.
    Raw,
    /// Annotated frame plus the 63 landmark values, only when a hand is seen.
    Landmarks,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaptureResult {
    Saved { index: usize, paths: Vec<PathBuf> },
    NoHand,
    TargetReached,
}

/// Interactive capture of training data for a list of signs.
#[derive(Debug)]
pub struct CollectSession {
    layout: DatasetLayout,
    mode: CollectMode,
    signs: Vec<String>,
    current: usize,
    count: usize,
    target: usize,
    crop_size: u32,
}

impl CollectSession {
    pub fn start(
        layout: DatasetLayout,
        mode: CollectMode,
        signs: Vec<String>,
        target: usize,
        crop_size: u32,
    ) -> Result<Self> {
        if signs.is_empty() {
            bail!("no signs to collect");
        }
        for sign in &signs {
            let dirs = match mode {
                CollectMode::Raw => vec![layout.raw_dir(sign)],
                CollectMode::Landmarks => vec![layout.images_dir(sign), layout.landmarks_dir(sign)],
            };
            for dir in dirs {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create dataset directory {dir:?}"))?;
            }
        }
        let mut session = Self {
            layout,
            mode,
            signs,
            current: 0,
            count: 0,
            target,
            crop_size,
        };
        session.recount();
        Ok(session)
    }

    pub fn mode(&self) -> CollectMode {
        self.mode
    }

    pub fn current_sign(&self) -> &str {
        &self.signs[self.current]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn crop_size(&self) -> u32 {
        self.crop_size
    }

    pub fn next_sign(&mut self) {
        self.current = (self.current + 1) % self.signs.len();
        self.recount();
    }

    pub fn prev_sign(&mut self) {
        self.current = (self.current + self.signs.len() - 1) % self.signs.len();
        self.recount();
    }

    pub fn status_line(&self) -> String {
        format!(
            "Sign: {} | Images: {}/{}",
            self.current_sign(),
            self.count,
            self.target
        )
    }

    fn recount(&mut self) {
        let sign = &self.signs[self.current];
        self.count = match self.mode {
            CollectMode::Raw => self.layout.count_raw(sign),
            CollectMode::Landmarks => self.layout.count_annotated(sign),
        };
        log::info!("collecting '{sign}': {} of {} present", self.count, self.target);
    }

    /// Saves the current frame for the current sign. `hands` is ignored in raw mode.
    pub fn capture(&mut self, frame: &Frame, hands: &[HandLandmarks]) -> Result<CaptureResult> {
        if self.count >= self.target {
            return Ok(CaptureResult::TargetReached);
        }
        let sign = self.current_sign().to_string();
        let index = self.count;
        let paths = match self.mode {
            CollectMode::Raw => {
                let path = self.layout.raw_image_path(&sign, index);
                save_jpeg(&crop_center(frame, self.crop_size)?, &path)?;
                vec![path]
            }
            CollectMode::Landmarks => {
                let Some(hand) = hands.first() else {
                    return Ok(CaptureResult::NoHand);
                };
                let vector = hand.to_vector()?;
                let mut annotated = frame.clone();
                draw_hand(
                    &mut Canvas::new(&mut annotated),
                    &hand.pixel_points(frame.width, frame.height),
                );
                let image_path = self.layout.annotated_image_path(&sign, index);
                let landmark_path = self.layout.landmark_path(&sign, index);
                save_jpeg(&annotated, &image_path)?;
                write_landmark_file(&landmark_path, &vector)?;
                vec![image_path, landmark_path]
            }
        };
        self.count += 1;
        log::info!("saved {sign} sample {}/{}", self.count, self.target);
        Ok(CaptureResult::Saved { index, paths })
    }
}

fn crop_center(frame: &Frame, size: u32) -> Result<Frame> {
    let [x1, y1, x2, y2] = centered_square(frame.width, frame.height, size);
    let side = (x2 - x1) as usize;
    let row_bytes = frame.width as usize * 4;
    let mut rgba = Vec::with_capacity(side * side * 4);
    for y in y1 as usize..y2 as usize {
        let start = y * row_bytes + x1 as usize * 4;
        let row = frame
            .rgba
            .get(start..start + side * 4)
            .context("frame buffer shorter than its dimensions")?;
        rgba.extend_from_slice(row);
    }
    Ok(Frame::new(rgba, side as u32, side as u32))
}

fn save_jpeg(frame: &Frame, path: &std::path::Path) -> Result<()> {
    let image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
        .context("frame buffer does not match its dimensions")?;
    DynamicImage::ImageRgba8(image)
        .to_rgb8()
        .save(path)
        .with_context(|| format!("failed to save {path:?}"))
}
