use std::{collections::VecDeque, time::SystemTime};

use crate::types::{DetectionResult, FocusState, FocusStatus};

#[derive(Clone, Debug)]
pub struct FocusConfig {
    pub window_size: usize,
    /// Hit fraction at or above which `Lost` becomes `Focused`.
    pub enter_threshold: f32,
    /// Hit fraction at or below which `Focused` becomes `Lost`.
    pub exit_threshold: f32,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            enter_threshold: 0.6,
            exit_threshold: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    hit: bool,
    confidence: f32,
}

/// Debounces per-frame face presence into a user-facing focus state.
///
/// The hit fraction is always taken over the configured window size, so
/// until the window fills up every missing slot counts as a miss.
#[derive(Debug)]
pub struct FocusStateMachine {
    cfg: FocusConfig,
    window: VecDeque<Sample>,
    status: FocusStatus,
}

impl FocusStateMachine {
    pub fn new(cfg: FocusConfig) -> Self {
        let window_size = cfg.window_size.max(1);
        Self {
            cfg: FocusConfig {
                window_size,
                ..cfg
            },
            window: VecDeque::with_capacity(window_size),
            status: FocusStatus::initial(),
        }
    }

    /// Feeds one frame's detections. Returns the new state on a transition.
    pub fn record(&mut self, result: &DetectionResult) -> Option<FocusState> {
        self.status.signal = true;
        self.status.face_detected = result.has_face();
        self.push(Sample {
            hit: result.has_face(),
            confidence: result.best_confidence(),
        });
        self.evaluate(result.timestamp)
    }

    /// Counts a failed capture as a miss and flags the missing signal.
    pub fn record_no_signal(&mut self) -> Option<FocusState> {
        self.status.signal = false;
        self.status.face_detected = false;
        self.push(Sample {
            hit: false,
            confidence: 0.0,
        });
        self.evaluate(SystemTime::now())
    }

    pub fn reset(&mut self) {
        self.window.clear();
        if self.status.state != FocusState::Lost {
            self.status.state = FocusState::Lost;
            self.status.since = SystemTime::now();
        }
        self.status.confidence = 0.0;
        self.status.face_detected = false;
    }

    pub fn status(&self) -> FocusStatus {
        self.status
    }

    pub fn hit_ratio(&self) -> f32 {
        let hits = self.window.iter().filter(|s| s.hit).count();
        hits as f32 / self.cfg.window_size as f32
    }

    fn push(&mut self, sample: Sample) {
        if self.window.len() == self.cfg.window_size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    fn evaluate(&mut self, at: SystemTime) -> Option<FocusState> {
        let ratio = self.hit_ratio();
        self.status.confidence =
            self.window.iter().map(|s| s.confidence).sum::<f32>() / self.cfg.window_size as f32;

        let next = match self.status.state {
            FocusState::Lost if ratio >= self.cfg.enter_threshold => FocusState::Focused,
            FocusState::Focused if ratio <= self.cfg.exit_threshold => FocusState::Lost,
            _ => return None,
        };

        log::debug!(
            "focus {:?} -> {next:?} (hit ratio {ratio:.2})",
            self.status.state
        );
        self.status.state = next;
        self.status.since = at;
        Some(next)
    }
}
