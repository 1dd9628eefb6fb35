use std::{
    borrow::Cow,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Result, anyhow};
use bytes::Bytes;

/// A captured camera image. The pixel buffer is shared and never written
/// after construction; annotation always works on a copy.
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub captured_at: SystemTime,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(
        sequence: u64,
        width: u32,
        height: u32,
        channels: u8,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            return Err(anyhow!("unsupported channel count {channels}"));
        }
        let expected_len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(channels as usize);
        if pixels.len() != expected_len || expected_len == 0 {
            return Err(anyhow!(
                "frame buffer size mismatch: got {}, expected {} ({}x{}x{})",
                pixels.len(),
                expected_len,
                width,
                height,
                channels
            ));
        }

        Ok(Self {
            sequence,
            width,
            height,
            channels,
            captured_at: SystemTime::now(),
            pixels: pixels.into(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Packed RGB view of the frame, borrowing when it already is RGB.
    pub fn rgb(&self) -> Cow<'_, [u8]> {
        match self.channels {
            3 => Cow::Borrowed(&self.pixels),
            4 => Cow::Owned(
                self.pixels
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect(),
            ),
            _ => Cow::Owned(self.pixels.iter().flat_map(|&v| [v, v, v]).collect()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeypointKind {
    RightEye,
    LeftEye,
    NoseTip,
    MouthCenter,
    RightEarTragion,
    LeftEarTragion,
}

impl KeypointKind {
    /// BlazeFace keypoint order.
    pub const ALL: [KeypointKind; 6] = [
        KeypointKind::RightEye,
        KeypointKind::LeftEye,
        KeypointKind::NoseTip,
        KeypointKind::MouthCenter,
        KeypointKind::RightEarTragion,
        KeypointKind::LeftEarTragion,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub kind: KeypointKind,
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned box in pixel coordinates of the source frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        }
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let [ax1, ay1, ax2, ay2] = self.corners();
        let [bx1, by1, bx2, by2] = other.corners();
        let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let inter = inter_w * inter_h;
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub keypoints: Vec<Keypoint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn empty(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            timestamp: frame.captured_at,
            detections: Vec::new(),
        }
    }

    pub fn has_face(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn best_confidence(&self) -> f32 {
        self.detections
            .iter()
            .map(|d| d.confidence)
            .fold(0.0, f32::max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusState {
    Focused,
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FocusStatus {
    pub state: FocusState,
    pub since: SystemTime,
    pub confidence: f32,
    /// False while the camera is not delivering frames.
    pub signal: bool,
    /// Raw presence in the most recent detection, before debouncing.
    pub face_detected: bool,
}

impl FocusStatus {
    pub fn initial() -> Self {
        Self {
            state: FocusState::Lost,
            since: SystemTime::now(),
            confidence: 0.0,
            signal: true,
            face_detected: false,
        }
    }

    pub fn is_focused(&self) -> bool {
        self.state == FocusState::Focused
    }

    pub fn since_unix_secs(&self) -> f64 {
        self.since
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// JPEG-encoded frame ready to be written to viewers.
#[derive(Clone, Debug, PartialEq)]
pub struct AnnotatedFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Bytes,
}
