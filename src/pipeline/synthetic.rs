use std::time::Duration;

use crate::{error::PipelineError, pipeline::camera::FrameSource, types::Frame};

const BACKGROUND: u8 = 24;
const PATCH: u8 = 230;

/// Camera-less source: a dark frame with a bright square drifting back and
/// forth, so the placeholder detector and the focus state have something to
/// react to. Every `absent_every`-th stretch of frames leaves the patch out.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_delay: Duration,
    next_sequence: u64,
    absent_every: Option<u64>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_delay: Duration::ZERO,
            next_sequence: 0,
            absent_every: None,
        }
    }

    /// Simulated sensor readout time per capture.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Drops the patch for 30 frames out of every `period` frames.
    pub fn with_absence(mut self, period: u64) -> Self {
        self.absent_every = Some(period.max(31));
        self
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut rgb = vec![BACKGROUND; w * h * 3];

        if self
            .absent_every
            .is_some_and(|period| sequence % period >= period - 30)
        {
            return rgb;
        }

        let side = (w.min(h) / 3).max(1);
        let travel = (w - side).max(1) as u64;
        let phase = sequence % (travel * 2);
        let x0 = if phase < travel {
            phase
        } else {
            travel * 2 - phase
        } as usize;
        let y0 = (h - side) / 2;

        for y in y0..(y0 + side).min(h) {
            let row = y * w * 3;
            for x in x0..(x0 + side).min(w) {
                let idx = row + x * 3;
                rgb[idx..idx + 3].fill(PATCH);
            }
        }
        rgb
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn capture(&mut self) -> Result<Frame, PipelineError> {
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        let sequence = self.next_sequence;
        let frame = Frame::new(sequence, self.width, self.height, 3, self.render(sequence))
            .map_err(|err| PipelineError::device(format!("{err:#}")))?;
        self.next_sequence += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_increase() {
        let mut source = SyntheticSource::new(32, 24);
        let seqs: Vec<u64> = (0..5).map(|_| source.capture().unwrap().sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn patch_is_drawn_and_can_be_absent() {
        let mut source = SyntheticSource::new(30, 30).with_absence(40);
        let first = source.capture().unwrap();
        assert!(first.pixels().contains(&PATCH));

        let absent = SyntheticSource::new(30, 30).with_absence(40).render(15);
        assert!(absent.iter().all(|&v| v == BACKGROUND));
    }
}
