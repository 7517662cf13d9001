use anyhow::{Context, Result, anyhow, bail};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{Frame, NUM_LANDMARKS};

pub const HANDPOSE_INPUT_SIZE: u32 = 224;
pub const PALM_INPUT_SIZE: u32 = 192;

/// Maps detector input pixels back to source frame pixels.
#[derive(Clone, Debug)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl Letterbox {
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Rotated square crop around a palm, as fed to the landmark model.
#[derive(Clone, Debug)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl CropTransform {
    /// Crop pixel → frame pixel, clamped to the frame.
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let (sin, cos) = self.angle.sin_cos();
        let ox = self.center.0 + dx * cos - dy * sin;
        let oy = self.center.1 + dx * sin + dy * cos;
        (
            ox.clamp(0.0, self.orig_w.saturating_sub(1) as f32),
            oy.clamp(0.0, self.orig_h.saturating_sub(1) as f32),
        )
    }

    /// Crop-space landmark → normalized frame coordinates. Depth is scaled
    /// like x so that it stays comparable across crop sizes.
    pub fn normalize(&self, point: [f32; 3]) -> [f32; 3] {
        let (px, py) = self.project(point[0], point[1]);
        let w = self.orig_w.max(1) as f32;
        let h = self.orig_h.max(1) as f32;
        let z = point[2] * (self.side / self.output_size as f32) / w;
        [px / w, py / h, z]
    }
}

fn check_frame(frame: &Frame) -> Result<()> {
    let expected_len = frame.pixel_count().saturating_mul(4);
    if frame.rgba.len() != expected_len {
        bail!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            expected_len
        );
    }
    if frame.width == 0 || frame.height == 0 {
        bail!("frame has zero size");
    }
    Ok(())
}

/// Aspect-preserving resize onto a black square canvas, as NHWC floats in [0, 1].
pub fn letterbox(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, Letterbox)> {
    check_frame(frame)?;

    let scale = target_size as f32 / frame.width.max(frame.height) as f32;
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let side = target_size as usize;
    let pad_x = (side - new_w as usize) / 2;
    let pad_y = (side - new_h as usize) / 2;
    let mut canvas = vec![0.0f32; side * side * 3];
    let src_stride = new_w as usize * 4;
    canvas
        .par_chunks_mut(side * 3)
        .enumerate()
        .skip(pad_y)
        .take(new_h as usize)
        .for_each(|(row, dst)| {
            let src = &resized[(row - pad_y) * src_stride..(row - pad_y + 1) * src_stride];
            for (x, px) in src.chunks_exact(4).enumerate() {
                let o = (pad_x + x) * 3;
                dst[o] = px[0] as f32 / 255.0;
                dst[o + 1] = px[1] as f32 / 255.0;
                dst[o + 2] = px[2] as f32 / 255.0;
            }
        });

    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), canvas)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((
        input,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

pub fn prepare_rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_frame(frame)?;

    let size = output_size as usize;
    let half = output_size as f32 / 2.0;
    let scale = side / output_size as f32;
    let (sin, cos) = angle.sin_cos();

    let mut data = vec![0.0f32; size * size * 3];
    data.par_chunks_mut(size * 3).enumerate().for_each(|(y, row)| {
        let dy = (y as f32 + 0.5 - half) * scale;
        for x in 0..size {
            let dx = (x as f32 + 0.5 - half) * scale;
            let src_x = center.0 + dx * cos - dy * sin;
            let src_y = center.1 + dx * sin + dy * cos;
            row[x * 3..x * 3 + 3].copy_from_slice(&sample_rgb(frame, src_x, src_y));
        }
    });

    let array = Array4::<f32>::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build rotated crop tensor: {err}"))?;

    Ok((
        array,
        CropTransform {
            center,
            side,
            angle,
            output_size,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

pub fn decode_landmarks(flat: &[f32]) -> Result<[[f32; 3]; NUM_LANDMARKS]> {
    if flat.len() < NUM_LANDMARKS * 3 {
        bail!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            NUM_LANDMARKS * 3
        );
    }
    let mut points = [[0.0f32; 3]; NUM_LANDMARKS];
    for (dst, chunk) in points.iter_mut().zip(flat.chunks_exact(3)) {
        dst.copy_from_slice(chunk);
    }
    Ok(points)
}

// Bilinear sample; outside the frame reads as black.
fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if !x.is_finite() || !y.is_finite() {
        return [0.0; 3];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let (w, h) = (frame.width as i64, frame.height as i64);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let (ix, iy) = (cx as i64, cy as i64);
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0; 3];
        }
        let idx = (iy as usize * frame.width as usize + ix as usize) * 4;
        match frame.rgba.get(idx..idx + 3) {
            Some(px) => [px[0] as f32 / 255.0, px[1] as f32 / 255.0, px[2] as f32 / 255.0],
            None => [0.0; 3],
        }
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x0 + 1.0, y0);
    let c01 = fetch(x0, y0 + 1.0);
    let c11 = fetch(x0 + 1.0, y0 + 1.0);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    std::array::from_fn(|c| lerp(lerp(c00[c], c10[c], fx), lerp(c01[c], c11[c], fx), fy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_the_short_side() {
        let frame = Frame::blank(200, 100);
        let (input, lb) = letterbox(&frame, 192).unwrap();
        assert_eq!(input.shape(), &[1, 192, 192, 3]);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 48.0);
        let (sx, sy) = lb.to_source(96.0, 96.0);
        assert!((sx - 100.0).abs() < 1e-3);
        assert!((sy - 50.0).abs() < 1e-3);
    }

    #[test]
    fn crop_transform_maps_center_to_center() {
        let t = CropTransform {
            center: (320.0, 240.0),
            side: 224.0,
            angle: 0.0,
            output_size: 224,
            orig_w: 640,
            orig_h: 480,
        };
        let [x, y, z] = t.normalize([112.0, 112.0, 6.4]);
        assert!((x - 0.5).abs() < 1e-6);
        assert!((y - 0.5).abs() < 1e-6);
        assert!((z - 0.01).abs() < 1e-6);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let mut frame = Frame::blank(10, 10);
        frame.rgba.pop();
        assert!(letterbox(&frame, 192).is_err());
        assert!(prepare_rotated_crop(&frame, (5.0, 5.0), 10.0, 0.0, 224).is_err());
    }

    #[test]
    fn decodes_exactly_21_points() {
        let flat: Vec<f32> = (0..63).map(|i| i as f32).collect();
        let points = decode_landmarks(&flat).unwrap();
        assert_eq!(points[20], [60.0, 61.0, 62.0]);
        assert!(decode_landmarks(&flat[..10]).is_err());
    }
}
