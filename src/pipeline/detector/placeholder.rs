use anyhow::Result;

use super::FaceModel;
use crate::types::{BoundingBox, Detection, Frame, Keypoint, KeypointKind};

/// Relative keypoint positions inside a face box, BlazeFace order.
const KEYPOINT_LAYOUT: [(f32, f32); 6] = [
    (0.32, 0.38),
    (0.68, 0.38),
    (0.50, 0.58),
    (0.50, 0.76),
    (0.08, 0.45),
    (0.92, 0.45),
];

/// Model-free backend: treats the bounding box of bright pixels as a face.
///
/// Confidence is how densely the box is filled times how bright it is, so
/// a solid bright patch scores high and scattered highlights score low.
#[derive(Clone, Debug)]
pub struct PlaceholderModel {
    pub luma_threshold: u8,
    /// Smallest share of the frame the bright region must cover.
    pub min_coverage: f32,
}

impl Default for PlaceholderModel {
    fn default() -> Self {
        Self {
            luma_threshold: 160,
            min_coverage: 0.005,
        }
    }
}

impl FaceModel for PlaceholderModel {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn run_inference(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let rgb = frame.rgb();
        let width = frame.width as usize;

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let mut count = 0usize;
        let mut luma_sum = 0u64;
        for (idx, px) in rgb.chunks_exact(3).enumerate() {
            let luma = (px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000;
            if luma < self.luma_threshold as u32 {
                continue;
            }
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            count += 1;
            luma_sum += luma as u64;
        }

        let total = width * frame.height as usize;
        if count == 0 || (count as f32) < total as f32 * self.min_coverage {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::from_corners(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        let fill = count as f32 / bbox.area().max(1.0);
        let brightness = luma_sum as f32 / count as f32 / 255.0;
        let keypoints = KeypointKind::ALL
            .iter()
            .zip(KEYPOINT_LAYOUT)
            .map(|(&kind, (rx, ry))| Keypoint {
                kind,
                x: bbox.x + bbox.width * rx,
                y: bbox.y + bbox.height * ry,
            })
            .collect();

        Ok(vec![Detection {
            bbox,
            confidence: (fill * brightness).clamp(0.0, 1.0),
            keypoints,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame_with_patch(w: u32, h: u32, patch: Option<(u32, u32, u32)>) -> Frame {
        let mut rgb = vec![20u8; (w * h * 3) as usize];
        if let Some((px, py, side)) = patch {
            for y in py..py + side {
                for x in px..px + side {
                    let idx = ((y * w + x) * 3) as usize;
                    rgb[idx..idx + 3].fill(255);
                }
            }
        }
        Frame::new(0, w, h, 3, rgb).unwrap()
    }

    #[test]
    fn solid_patch_is_a_confident_face() {
        let mut model = PlaceholderModel::default();
        let detections = model
            .run_inference(&frame_with_patch(64, 48, Some((10, 8, 16))))
            .unwrap();
        assert_eq!(detections.len(), 1);
        let face = &detections[0];
        assert_relative_eq!(face.bbox.x, 10.0);
        assert_relative_eq!(face.bbox.y, 8.0);
        assert_relative_eq!(face.bbox.width, 16.0);
        assert_relative_eq!(face.confidence, 1.0);
        assert_eq!(face.keypoints.len(), 6);
        assert!(face.keypoints.iter().all(|k| {
            k.x >= face.bbox.x && k.x <= face.bbox.x + face.bbox.width
        }));
    }

    #[test]
    fn dark_frame_has_no_face() {
        let mut model = PlaceholderModel::default();
        assert!(
            model
                .run_inference(&frame_with_patch(64, 48, None))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn scattered_highlights_score_low() {
        let mut rgb = vec![20u8; 40 * 40 * 3];
        for &(x, y) in &[(0usize, 0usize), (39, 39), (0, 39), (39, 0), (20, 20)] {
            for dy in 0..2 {
                for dx in 0..2 {
                    let idx = (((y.min(38) + dy) * 40) + x.min(38) + dx) * 3;
                    rgb[idx..idx + 3].fill(255);
                }
            }
        }
        let frame = Frame::new(0, 40, 40, 3, rgb).unwrap();
        let detections = PlaceholderModel::default().run_inference(&frame).unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].confidence < 0.1);
    }
}
