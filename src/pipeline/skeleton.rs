use crate::types::Frame;

/// MediaPipe hand topology.
pub const CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    (0, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    (0, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
    (5, 9),
    (9, 13),
    (13, 17),
];

pub const BONE_COLOR: [u8; 4] = [56, 189, 248, 255];
pub const JOINT_COLOR: [u8; 4] = [248, 113, 113, 255];
pub const CONFIDENT_COLOR: [u8; 4] = [34, 197, 94, 255];
pub const UNCERTAIN_COLOR: [u8; 4] = [251, 146, 60, 255];
pub const GUIDE_COLOR: [u8; 4] = [59, 130, 246, 255];

/// Mutable RGBA view for drawing overlays in place.
pub struct Canvas<'a> {
    buffer: &'a mut [u8],
    width: u32,
    height: u32,
}

impl<'a> Canvas<'a> {
    pub fn new(frame: &'a mut Frame) -> Self {
        Self {
            buffer: &mut frame.rgba,
            width: frame.width,
            height: frame.height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    // Line width that looks the same on a 640 px preview and a 1080p frame.
    fn stroke(&self) -> i32 {
        ((self.width.max(self.height) as f32 / 640.0) * 3.0).round().max(2.0) as i32
    }

    pub fn put_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        if let Some(px) = self.buffer.get_mut(idx..idx + 4) {
            px.copy_from_slice(&color);
        }
    }

    pub fn line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 4], thickness: i32) {
        let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
        let (x1, y1) = (p1.0 as i32, p1.1 as i32);
        let dx = (x1 - x0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let dy = -(y1 - y0).abs();
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (thickness.max(1) - 1) / 2;

        loop {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox.abs() + oy.abs() <= radius {
                        self.put_pixel(x0 + ox, y0 + oy, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    pub fn circle(&mut self, center: (i32, i32), radius: i32, color: [u8; 4]) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put_pixel(center.0 + dx, center.1 + dy, color);
                }
            }
        }
    }

    pub fn rect(&mut self, [x1, y1, x2, y2]: [f32; 4], color: [u8; 4], thickness: i32) {
        self.line((x1, y1), (x2, y1), color, thickness);
        self.line((x2, y1), (x2, y2), color, thickness);
        self.line((x2, y2), (x1, y2), color, thickness);
        self.line((x1, y2), (x1, y1), color, thickness);
    }

    pub fn fill_rect(&mut self, [x1, y1, x2, y2]: [f32; 4], color: [u8; 4]) {
        for y in y1.max(0.0) as i32..y2.min(self.height as f32) as i32 {
            for x in x1.max(0.0) as i32..x2.min(self.width as f32) as i32 {
                self.put_pixel(x, y, color);
            }
        }
    }
}

/// Bones and joints for one hand, points in frame pixels.
pub fn draw_hand(canvas: &mut Canvas<'_>, points: &[(f32, f32)]) {
    if points.len() < 2 {
        return;
    }
    let stroke = canvas.stroke();
    for &(a, b) in CONNECTIONS {
        if let (Some(pa), Some(pb)) = (points.get(a), points.get(b)) {
            canvas.line(*pa, *pb, BONE_COLOR, stroke);
        }
    }
    let radius = stroke + 2;
    for &(x, y) in points {
        canvas.circle((x as i32, y as i32), radius, JOINT_COLOR);
    }
}

/// Centred square of `side` pixels, clamped to the frame: `[x1, y1, x2, y2]`.
pub fn centered_square(width: u32, height: u32, side: u32) -> [u32; 4] {
    let side = side.min(width).min(height);
    let x1 = (width - side) / 2;
    let y1 = (height - side) / 2;
    [x1, y1, x1 + side, y1 + side]
}

/// Where the user should hold their hand.
pub fn draw_guide_box(canvas: &mut Canvas<'_>) {
    let side = (canvas.width().min(canvas.height()) as f32 * 0.6) as u32;
    let [x1, y1, x2, y2] = centered_square(canvas.width(), canvas.height(), side);
    let stroke = canvas.stroke();
    canvas.rect([x1 as f32, y1 as f32, x2 as f32, y2 as f32], GUIDE_COLOR, stroke);
}

/// Horizontal bar in the lower-left corner, filled to `confidence`.
pub fn draw_confidence_bar(canvas: &mut Canvas<'_>, confidence: f32, confident: bool) {
    let scale = canvas.width().max(canvas.height()) as f32 / 640.0;
    let (w, h, margin) = (200.0 * scale, 16.0 * scale, 12.0 * scale);
    let y2 = canvas.height() as f32 - margin;
    let outline = [margin, y2 - h, margin + w, y2];
    let color = if confident { CONFIDENT_COLOR } else { UNCERTAIN_COLOR };
    canvas.fill_rect(
        [margin, y2 - h, margin + w * confidence.clamp(0.0, 1.0), y2],
        color,
    );
    canvas.rect(outline, [255, 255, 255, 255], 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drawing_stays_inside_the_buffer() {
        let mut frame = Frame::blank(32, 24);
        let mut canvas = Canvas::new(&mut frame);
        canvas.line((-50.0, -50.0), (100.0, 100.0), BONE_COLOR, 5);
        canvas.circle((31, 23), 10, JOINT_COLOR);
        draw_confidence_bar(&mut canvas, 2.0, true);
        assert_eq!(frame.rgba.len(), 32 * 24 * 4);
        assert_eq!(&frame.rgba[..4], &BONE_COLOR);
    }

    #[test]
    fn hand_overlay_marks_joints() {
        let mut frame = Frame::blank(64, 64);
        let points: Vec<(f32, f32)> = (0..21).map(|i| (10.0 + i as f32, 32.0)).collect();
        draw_hand(&mut Canvas::new(&mut frame), &points);
        let idx = (32 * 64 + 30) * 4;
        assert_eq!(&frame.rgba[idx..idx + 4], &JOINT_COLOR);
    }

    #[test]
    fn square_is_centred_and_clamped() {
        assert_eq!(centered_square(640, 480, 300), [170, 90, 470, 390]);
        assert_eq!(centered_square(200, 100, 300), [50, 0, 150, 100]);
    }
}
