use super::{Arc, ImageBuffer, ImageFrame, RenderImage, Rgba};
use crate::tester::Banner;
use crate::types::Frame;

pub(super) fn frame_to_image(frame: &Frame) -> Option<Arc<RenderImage>> {
    let mut rgba = frame.rgba.clone();

    // GPUI expects BGRA.
    for px in rgba.chunks_exact_mut(4) {
        px.swap(0, 2);
    }

    let buffer = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(frame.width, frame.height, rgba)?;
    let frame = ImageFrame::new(buffer);

    Some(Arc::new(RenderImage::new(vec![frame])))
}

/// Background and text colours for an overlay banner.
pub(super) fn banner_colors(banner: &Banner) -> (u32, u32) {
    match banner {
        Banner::Emergency => (0xf59e0b33, 0xfcd34d),
        Banner::CameraError | Banner::Error(_) => (0xef444433, 0xfca5a5),
    }
}

pub(super) fn status_color(confident: bool, hand_detected: bool) -> u32 {
    match (confident, hand_detected) {
        (true, _) => 0x22c55e,
        (false, true) => 0xfb923c,
        (false, false) => 0x8b95a5,
    }
}
