use std::convert::TryFrom;

use anyhow::{Context, Result, anyhow, bail};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

/// Pixel layouts delivered by webcams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

/// Converts one raw capture buffer into an RGBA frame.
pub fn to_frame(layout: PixelLayout, data: &[u8], width: u32, height: u32) -> Result<Frame> {
    let rgba = match layout {
        PixelLayout::Mjpeg => return decode_jpeg(data),
        PixelLayout::Nv12 => nv12_to_rgba(data, width, height)?,
        PixelLayout::Yuyv => yuyv_to_rgba(data, width, height)?,
        PixelLayout::Rgb => rgb_like_to_rgba(data, width, height, false)?,
        PixelLayout::Bgr => rgb_like_to_rgba(data, width, height, true)?,
        PixelLayout::Gray => gray_to_rgba(data, width, height)?,
    };
    Ok(Frame::new(rgba, width, height))
}

#[cfg(feature = "camera-nokhwa")]
pub fn convert_camera_frame(buffer: &nokhwa::Buffer) -> Result<Frame> {
    use nokhwa::utils::FrameFormat;

    let resolution = buffer.resolution();
    let layout = match buffer.source_frame_format() {
        FrameFormat::NV12 => PixelLayout::Nv12,
        FrameFormat::YUYV => PixelLayout::Yuyv,
        FrameFormat::MJPEG => PixelLayout::Mjpeg,
        FrameFormat::RAWRGB => PixelLayout::Rgb,
        FrameFormat::RAWBGR => PixelLayout::Bgr,
        FrameFormat::GRAY => PixelLayout::Gray,
    };
    to_frame(layout, buffer.buffer(), resolution.width_x, resolution.height_y)
}

/// Decodes an uploaded still image (JPEG or PNG).
pub fn decode_image_bytes(bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() {
        bail!("image payload is empty");
    }
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return decode_jpeg(bytes);
    }
    let image = image::load_from_memory(bytes).context("unsupported image payload")?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(Frame::new(rgba.into_raw(), width, height))
}

fn decode_jpeg(data: &[u8]) -> Result<Frame> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("JPEG decode failed: {err:?}"))?;

    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("JPEG decoder returned no image info"))?;
    let width = u32::try_from(info.width).map_err(|_| anyhow!("JPEG width out of range"))?;
    let height = u32::try_from(info.height).map_err(|_| anyhow!("JPEG height out of range"))?;
    let expected_len = width as usize * height as usize * 4;
    if rgba.len() < expected_len {
        bail!(
            "JPEG decode produced too few bytes: got {}, expected {}",
            rgba.len(),
            expected_len
        );
    }

    Ok(Frame::new(rgba, width, height))
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_plane_len = width as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;
    ensure_len("NV12", data, y_plane_len + uv_plane_len)?;

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_plane_len],
        y_stride: width,
        uv_plane: &data[y_plane_len..y_plane_len + uv_plane_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgba = vec![0u8; y_plane_len * 4];
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len("YUYV", data, pixels * 2)?;

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgba = vec![0u8; pixels * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

fn rgb_like_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len("RGB", data, pixels * 3)?;

    let (r, b) = if swap_rb { (2, 0) } else { (0, 2) };
    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(3))
        .for_each(|(dst, src)| {
            dst[0] = src[r];
            dst[1] = src[1];
            dst[2] = src[b];
            dst[3] = 255;
        });
    Ok(rgba)
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len("GRAY", data, pixels)?;

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_iter().copied())
        .for_each(|(dst, value)| {
            dst[..3].fill(value);
            dst[3] = 255;
        });
    Ok(rgba)
}

fn ensure_len(format: &str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        bail!(
            "{format} buffer too small: got {}, expected {expected}",
            data.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn bgr_channels_are_swapped() {
        let frame = to_frame(PixelLayout::Bgr, &[10, 20, 30, 1, 2, 3], 2, 1).unwrap();
        assert_eq!(frame.rgba, vec![30, 20, 10, 255, 3, 2, 1, 255]);
    }

    #[test]
    fn gray_expands_to_opaque_rgba() {
        let frame = to_frame(PixelLayout::Gray, &[7, 9], 1, 2).unwrap();
        assert_eq!(frame.rgba, vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(to_frame(PixelLayout::Rgb, &[1, 2, 3], 2, 2).is_err());
        assert!(to_frame(PixelLayout::Yuyv, &[0; 3], 2, 2).is_err());
        assert!(decode_image_bytes(&[]).is_err());
        assert!(decode_image_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn decodes_png_and_jpeg_uploads() {
        let img = RgbaImage::from_pixel(4, 3, image::Rgba([200, 100, 50, 255]));

        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();
        let frame = decode_image_bytes(&png).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(&frame.rgba[..4], &[200, 100, 50, 255]);

        let rgb = image::DynamicImage::ImageRgba8(img).to_rgb8();
        let mut jpeg = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg).unwrap();
        let frame = decode_image_bytes(&jpeg).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.rgba.len(), 4 * 3 * 4);
    }
}
