use bytes::Bytes;
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};

use crate::{
    error::PipelineError,
    types::{AnnotatedFrame, Detection, DetectionResult, Frame, KeypointKind},
};

const BOX_COLOR: [u8; 3] = [0, 220, 0];
const LABEL_TEXT: [u8; 3] = [0, 0, 0];
const BANNER_COLOR: [u8; 3] = [200, 30, 30];
const BANNER_TEXT: [u8; 3] = [255, 255, 255];

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;

#[derive(Clone, Debug)]
pub struct AnnotatorConfig {
    pub jpeg_quality: u8,
    pub box_thickness: i32,
    pub draw_keypoints: bool,
    pub keypoint_radius: i32,
    /// Pixel size of one font cell.
    pub text_scale: i32,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            box_thickness: 3,
            draw_keypoints: true,
            keypoint_radius: 3,
            text_scale: 2,
        }
    }
}

/// Draws detections onto a copy of the frame and encodes it as JPEG.
/// Output depends only on the inputs and the configuration.
#[derive(Clone, Debug, Default)]
pub struct Annotator {
    cfg: AnnotatorConfig,
}

impl Annotator {
    pub fn new(cfg: AnnotatorConfig) -> Self {
        Self { cfg }
    }

    pub fn annotate(
        &self,
        frame: &Frame,
        result: &DetectionResult,
    ) -> Result<AnnotatedFrame, PipelineError> {
        let rgb = self.render(frame, result);
        self.encode(frame, &rgb)
    }

    /// Encodes the frame as-is, used while tracking is paused.
    pub fn passthrough(&self, frame: &Frame) -> Result<AnnotatedFrame, PipelineError> {
        self.encode(frame, &frame.rgb())
    }

    /// RGB copy of the frame with the overlay drawn on it.
    pub fn render(&self, frame: &Frame, result: &DetectionResult) -> Vec<u8> {
        let mut canvas = Canvas {
            rgb: frame.rgb().into_owned(),
            width: frame.width,
            height: frame.height,
        };

        if result.detections.is_empty() {
            self.draw_banner(&mut canvas, "NO FACE");
        }
        for detection in &result.detections {
            self.draw_detection(&mut canvas, detection);
        }
        canvas.rgb
    }

    fn draw_detection(&self, canvas: &mut Canvas, detection: &Detection) {
        let [x1, y1, x2, y2] = detection.bbox.corners();
        canvas.rect(x1, y1, x2, y2, BOX_COLOR, self.cfg.box_thickness);

        let label = format!("{:.0}%", detection.confidence * 100.0);
        let scale = self.cfg.text_scale.max(1);
        let pad = scale;
        let label_w = text_width(&label, scale) + pad * 2;
        let label_h = GLYPH_H * scale + pad * 2;
        let lx = x1 as i32;
        let ly = if y1 as i32 >= label_h {
            y1 as i32 - label_h
        } else {
            y1 as i32
        };
        canvas.fill_rect(lx, ly, label_w, label_h, BOX_COLOR);
        canvas.text(lx + pad, ly + pad, &label, scale, LABEL_TEXT);

        if self.cfg.draw_keypoints {
            for keypoint in &detection.keypoints {
                canvas.circle(
                    keypoint.x as i32,
                    keypoint.y as i32,
                    self.cfg.keypoint_radius,
                    keypoint_color(keypoint.kind),
                );
            }
        }
    }

    fn draw_banner(&self, canvas: &mut Canvas, text: &str) {
        let scale = self.cfg.text_scale.max(1);
        let pad = scale * 2;
        let w = text_width(text, scale) + pad * 2;
        let h = GLYPH_H * scale + pad * 2;
        let x = (canvas.width as i32 - w) / 2;
        canvas.fill_rect(x, pad, w, h, BANNER_COLOR);
        canvas.text(x + pad, pad * 2, text, scale, BANNER_TEXT);
    }

    fn encode(&self, frame: &Frame, rgb: &[u8]) -> Result<AnnotatedFrame, PipelineError> {
        let mut jpeg = Vec::with_capacity(rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.cfg.jpeg_quality.clamp(1, 100))
            .encode(rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|err| PipelineError::EncodingFailure {
                sequence: frame.sequence,
                reason: err.to_string(),
            })?;

        Ok(AnnotatedFrame {
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            jpeg: Bytes::from(jpeg),
        })
    }
}

pub fn keypoint_color(kind: KeypointKind) -> [u8; 3] {
    match kind {
        KeypointKind::RightEye => [59, 130, 246],
        KeypointKind::LeftEye => [14, 165, 233],
        KeypointKind::NoseTip => [250, 204, 21],
        KeypointKind::MouthCenter => [239, 68, 68],
        KeypointKind::RightEarTragion => [168, 85, 247],
        KeypointKind::LeftEarTragion => [236, 72, 153],
    }
}

struct Canvas {
    rgb: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    fn rect(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, color: [u8; 3], thickness: i32) {
        self.line((x1, y1), (x2, y1), color, thickness);
        self.line((x2, y1), (x2, y2), color, thickness);
        self.line((x2, y2), (x1, y2), color, thickness);
        self.line((x1, y2), (x1, y1), color, thickness);
    }

    fn line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 3], thickness: i32) {
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
                        self.put(x0 + ox, y0 + oy, color);
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

    fn circle(&mut self, cx: i32, cy: i32, radius: i32, color: [u8; 3]) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, color: [u8; 3]) {
        for py in y..y + h {
            for px in x..x + w {
                self.put(px, py, color);
            }
        }
    }

    fn text(&mut self, x: i32, y: i32, text: &str, scale: i32, color: [u8; 3]) {
        let mut cursor = x;
        for ch in text.chars() {
            let rows = glyph(ch);
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - col)) != 0 {
                        self.fill_rect(
                            cursor + col * scale,
                            y + row as i32 * scale,
                            scale,
                            scale,
                            color,
                        );
                    }
                }
            }
            cursor += (GLYPH_W + 1) * scale;
        }
    }

    fn put(&mut self, x: i32, y: i32, color: [u8; 3]) {
        if x < 0 || y < 0 {
            return;
        }
        let (ux, uy) = (x as u32, y as u32);
        if ux >= self.width || uy >= self.height {
            return;
        }
        let idx = ((uy * self.width + ux) as usize) * 3;
        if let Some(px) = self.rgb.get_mut(idx..idx + 3) {
            px.copy_from_slice(&color);
        }
    }
}

fn text_width(text: &str, scale: i32) -> i32 {
    let chars = text.chars().count() as i32;
    (chars * (GLYPH_W + 1) - 1).max(0) * scale
}

/// 5x7 bitmap rows, most significant of the low five bits is the left column.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1E, 0x01, 0x01, 0x0E, 0x01, 0x01, 0x1E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        _ => [0; 7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Keypoint};

    fn gray_frame(w: u32, h: u32) -> Frame {
        Frame::new(9, w, h, 3, vec![90; (w * h * 3) as usize]).unwrap()
    }

    fn with_face(frame: &Frame) -> DetectionResult {
        DetectionResult {
            sequence: frame.sequence,
            timestamp: frame.captured_at,
            detections: vec![Detection {
                bbox: BoundingBox::from_corners(20.0, 30.0, 60.0, 70.0),
                confidence: 0.87,
                keypoints: vec![Keypoint {
                    kind: KeypointKind::NoseTip,
                    x: 40.0,
                    y: 50.0,
                }],
            }],
        }
    }

    fn pixel(rgb: &[u8], width: u32, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * width + x) * 3) as usize;
        [rgb[idx], rgb[idx + 1], rgb[idx + 2]]
    }

    #[test]
    fn annotate_is_pure_and_leaves_frame_untouched() {
        let frame = gray_frame(80, 80);
        let before = frame.pixels().to_vec();
        let result = with_face(&frame);
        let annotator = Annotator::default();

        let a = annotator.annotate(&frame, &result).unwrap();
        let b = annotator.annotate(&frame, &result).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sequence, 9);
        assert_eq!(frame.pixels(), before.as_slice());
        assert_eq!(&a.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn box_and_keypoint_are_drawn() {
        let frame = gray_frame(80, 80);
        let rgb = Annotator::default().render(&frame, &with_face(&frame));
        assert_eq!(pixel(&rgb, 80, 60, 50), BOX_COLOR);
        assert_eq!(
            pixel(&rgb, 80, 40, 50),
            keypoint_color(KeypointKind::NoseTip)
        );
        // Label background sits above the box.
        assert_eq!(pixel(&rgb, 80, 20, 29), BOX_COLOR);
    }

    #[test]
    fn empty_result_gets_banner_only() {
        let frame = gray_frame(120, 60);
        let result = DetectionResult::empty(&frame);
        let rgb = Annotator::default().render(&frame, &result);
        assert_eq!(pixel(&rgb, 120, 60, 4), BANNER_COLOR);
        assert_eq!(pixel(&rgb, 120, 60, 59), [90, 90, 90]);
    }

    #[test]
    fn keypoints_can_be_disabled() {
        let frame = gray_frame(80, 80);
        let annotator = Annotator::new(AnnotatorConfig {
            draw_keypoints: false,
            ..AnnotatorConfig::default()
        });
        let rgb = annotator.render(&frame, &with_face(&frame));
        assert_eq!(pixel(&rgb, 80, 40, 50), [90, 90, 90]);
    }

    #[test]
    fn passthrough_accepts_grayscale() {
        let frame = Frame::new(3, 16, 8, 1, vec![128; 16 * 8]).unwrap();
        let out = Annotator::default().passthrough(&frame).unwrap();
        assert_eq!((out.width, out.height, out.sequence), (16, 8, 3));
        let decoded = image::load_from_memory(&out.jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
    }

    #[test]
    fn label_width_counts_spacing() {
        assert_eq!(text_width("85%", 1), 17);
        assert_eq!(text_width("", 2), 0);
    }
}
