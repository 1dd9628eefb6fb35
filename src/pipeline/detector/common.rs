use std::cmp::Ordering;

use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{BoundingBox, Detection, Frame, Keypoint, KeypointKind};

/// Box deltas (4) followed by six (x, y) keypoints.
pub const REGRESSOR_FEATURES: usize = 4 + KeypointKind::ALL.len() * 2;
pub const NMS_IOU_THRESHOLD: f32 = 0.3;

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Resizes the frame into a square `target_size` canvas keeping its aspect
/// ratio, and returns a `[1, size, size, 3]` tensor scaled to `[-1, 1]`.
pub fn prepare_frame(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round().max(1.0) as u32).min(target_size);
    let new_h = ((frame.height as f32 * scale).round().max(1.0) as u32).min(target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgb().into_owned(),
        fir::PixelType::U8x3,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x3);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = (target_size - new_w) as usize / 2;
    let pad_y = (target_size - new_h) as usize / 2;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 3];
    let dst_stride = target_size as usize * 3;
    let src_stride = new_w as usize * 3;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 3;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_iter()
        .map(|&v| v as f32 / 127.5 - 1.0)
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        normalized,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((
        input,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

/// Anchor centres in normalised input coordinates, one entry per
/// `(stride, anchors_per_cell)` layer, row-major per grid.
pub fn generate_anchors(input_size: u32, layers: &[(u32, usize)]) -> Vec<[f32; 2]> {
    let mut anchors = Vec::new();
    for &(stride, per_cell) in layers {
        let grid = (input_size / stride).max(1) as usize;
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

/// Turns raw regressor/score tensors into frame-space detections above
/// `score_threshold`, after non-max suppression.
pub fn decode_detections(
    regressors: &[f32],
    scores: &[f32],
    anchors: &[[f32; 2]],
    input_size: u32,
    letterbox: &LetterboxInfo,
    score_threshold: f32,
) -> Result<Vec<Detection>> {
    if regressors.len() < anchors.len() * REGRESSOR_FEATURES {
        return Err(anyhow!(
            "regressor tensor too small: got {}, need {} for {} anchors",
            regressors.len(),
            anchors.len() * REGRESSOR_FEATURES,
            anchors.len()
        ));
    }
    if scores.len() < anchors.len() {
        return Err(anyhow!(
            "score tensor too small: got {}, need {}",
            scores.len(),
            anchors.len()
        ));
    }

    let input = input_size as f32;
    let extent = letterbox.orig_w.max(letterbox.orig_h) as f32;
    let pad_bias_x = letterbox.pad_x / letterbox.scale;
    let pad_bias_y = letterbox.pad_y / letterbox.scale;
    let max_x = letterbox.orig_w as f32;
    let max_y = letterbox.orig_h as f32;
    let to_frame = |nx: f32, ny: f32| {
        (
            (nx * extent - pad_bias_x).clamp(0.0, max_x),
            (ny * extent - pad_bias_y).clamp(0.0, max_y),
        )
    };

    let mut candidates = Vec::new();
    for (idx, anchor) in anchors.iter().enumerate() {
        let score = sigmoid(scores[idx].clamp(-100.0, 100.0));
        if score < score_threshold {
            continue;
        }

        let features = &regressors[idx * REGRESSOR_FEATURES..(idx + 1) * REGRESSOR_FEATURES];
        let cx = anchor[0] + features[0] / input;
        let cy = anchor[1] + features[1] / input;
        let hw = features[2] / input / 2.0;
        let hh = features[3] / input / 2.0;

        let (x1, y1) = to_frame(cx - hw, cy - hh);
        let (x2, y2) = to_frame(cx + hw, cy + hh);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let keypoints = KeypointKind::ALL
            .iter()
            .enumerate()
            .map(|(k, &kind)| {
                let (x, y) = to_frame(
                    anchor[0] + features[4 + k * 2] / input,
                    anchor[1] + features[4 + k * 2 + 1] / input,
                );
                Keypoint { kind, x, y }
            })
            .collect();

        candidates.push(Detection {
            bbox: BoundingBox::from_corners(x1, y1, x2, y2),
            confidence: score,
            keypoints,
        });
    }

    Ok(nms(candidates, NMS_IOU_THRESHOLD))
}

/// Greedy non-max suppression, strongest first.
pub fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
