pub mod common;
#[cfg(feature = "detector-ort")]
mod ort;
mod placeholder;

use std::{
    cmp::Ordering,
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};

#[cfg(feature = "detector-ort")]
pub use self::ort::BlazeFaceModel;
pub use self::placeholder::PlaceholderModel;
use super::join_within;
use crate::{
    config::{BackendKind, Config},
    error::PipelineError,
    types::{Detection, DetectionResult, Frame},
};

/// The face-detection capability. Backends return raw detections in frame
/// pixel coordinates; thresholding and ordering happen in [`Detector`].
pub trait FaceModel: Send + 'static {
    fn name(&self) -> &'static str;

    fn run_inference(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub max_detections: usize,
    /// Longest `detect` waits for the model on a single frame.
    pub budget: Duration,
    /// Consecutive timeouts after which the detector reports degraded.
    pub degrade_after: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_detections: 4,
            budget: Duration::from_millis(250),
            degrade_after: 3,
        }
    }
}

type Reply = (u64, anyhow::Result<Vec<Detection>>);

/// Runs a [`FaceModel`] on its own thread with a per-frame time budget.
///
/// At most one frame is ever with the model. When a frame overruns the
/// budget it gets an empty result, following frames are skipped until the
/// model is free again, and the late answer is discarded. Skipped frames
/// count as missed budgets, so a hung model still ends up degraded.
pub struct Detector {
    cfg: DetectorConfig,
    model_name: &'static str,
    request_tx: Option<Sender<Frame>>,
    reply_rx: Receiver<Reply>,
    worker: Option<thread::JoinHandle<()>>,
    in_flight: Option<u64>,
    consecutive_timeouts: u32,
}

impl Detector {
    pub fn spawn(model: Box<dyn FaceModel>, cfg: DetectorConfig) -> anyhow::Result<Self> {
        let (request_tx, request_rx) = bounded::<Frame>(1);
        let (reply_tx, reply_rx) = bounded::<Reply>(1);
        let model_name = model.name();

        let worker = thread::Builder::new()
            .name("face-model".into())
            .spawn(move || run_model_loop(model, request_rx, reply_tx))?;

        log::info!(
            "face detector ready: backend={model_name} threshold={} max_detections={} budget={:?}",
            cfg.confidence_threshold,
            cfg.max_detections,
            cfg.budget
        );

        Ok(Self {
            cfg,
            model_name,
            request_tx: Some(request_tx),
            reply_rx,
            worker: Some(worker),
            in_flight: None,
            consecutive_timeouts: 0,
        })
    }

    pub fn model_name(&self) -> &'static str {
        self.model_name
    }

    /// True while the model keeps overrunning its budget.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_timeouts >= self.cfg.degrade_after
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<DetectionResult, PipelineError> {
        self.detect_with_threshold(frame, self.cfg.confidence_threshold)
    }

    pub fn detect_with_threshold(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<DetectionResult, PipelineError> {
        if let Some(pending) = self.in_flight {
            match self.reply_rx.try_recv() {
                Ok((sequence, _)) => {
                    log::debug!("discarding late detection for frame {sequence}");
                    self.in_flight = None;
                }
                Err(TryRecvError::Empty) => {
                    log::debug!("model still busy with frame {pending}");
                    self.missed_budget();
                    return Err(PipelineError::DetectorBusy {
                        sequence: frame.sequence,
                    });
                }
                Err(TryRecvError::Disconnected) => return Err(self.model_gone(frame)),
            }
        }

        let Some(request_tx) = self.request_tx.as_ref() else {
            return Err(self.model_gone(frame));
        };
        match request_tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(PipelineError::DetectorBusy {
                    sequence: frame.sequence,
                });
            }
            Err(TrySendError::Disconnected(_)) => return Err(self.model_gone(frame)),
        }

        let deadline = Instant::now() + self.cfg.budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.reply_rx.recv_timeout(remaining) {
                Ok((sequence, reply)) if sequence == frame.sequence => {
                    self.consecutive_timeouts = 0;
                    let detections =
                        reply.map_err(|source| PipelineError::InferenceFailure {
                            sequence,
                            source,
                        })?;
                    return Ok(DetectionResult {
                        sequence: frame.sequence,
                        timestamp: frame.captured_at,
                        detections: filter_detections(
                            detections,
                            confidence_threshold,
                            self.cfg.max_detections,
                        ),
                    });
                }
                Ok((sequence, _)) => {
                    log::debug!("discarding stale detection for frame {sequence}");
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.in_flight = Some(frame.sequence);
                    self.missed_budget();
                    return Err(PipelineError::InferenceTimeout {
                        sequence: frame.sequence,
                        budget: self.cfg.budget,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.model_gone(frame)),
            }
        }
    }

    fn missed_budget(&mut self) {
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        if self.consecutive_timeouts == self.cfg.degrade_after {
            log::warn!(
                "{} missed its {:?} budget {} times in a row, reducing frame rate",
                self.model_name,
                self.cfg.budget,
                self.consecutive_timeouts
            );
        }
    }

    fn model_gone(&self, frame: &Frame) -> PipelineError {
        PipelineError::InferenceFailure {
            sequence: frame.sequence,
            source: anyhow!("{} thread stopped", self.model_name),
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.request_tx.take();
        let Some(handle) = self.worker.take() else {
            return;
        };
        // A hung model must not hold up shutdown; the thread ends with the process.
        if !join_within(handle, self.cfg.budget) {
            log::warn!("{} still running at shutdown, detaching", self.model_name);
        }
    }
}

fn run_model_loop(
    mut model: Box<dyn FaceModel>,
    request_rx: Receiver<Frame>,
    reply_tx: Sender<Reply>,
) {
    while let Some(frame) = recv_latest_frame(&request_rx) {
        let reply = model.run_inference(&frame);
        if reply_tx.send((frame.sequence, reply)).is_err() {
            break;
        }
    }
    log::debug!("{} thread exiting", model.name());
}

fn recv_latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    let mut frame = frame_rx.recv().ok()?;
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}

/// Keeps detections at or above the threshold, strongest first, at most
/// `max_detections` of them. Ties keep the model's order.
pub fn filter_detections(
    detections: Vec<Detection>,
    confidence_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    let mut kept: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_threshold)
        .map(|mut d| {
            d.confidence = d.confidence.clamp(0.0, 1.0);
            d
        })
        .collect();
    kept.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    kept.truncate(max_detections);
    kept
}

/// Builds the configured backend. Loading happens here, before the server
/// starts, so a broken model is a startup error.
pub fn build_model(config: &Config) -> anyhow::Result<Box<dyn FaceModel>> {
    match config.backend {
        BackendKind::Placeholder => Ok(Box::new(PlaceholderModel::default())),
        #[cfg(feature = "detector-ort")]
        BackendKind::Ort => {
            let model_path = crate::model_download::ensure_model_ready(
                &config.resolved_model_path(),
                config.model_url.as_deref(),
                |_evt| {},
            )?;
            let model = BlazeFaceModel::load(
                &model_path,
                config.model_variant,
                config.confidence_threshold,
            )?;
            Ok(Box::new(model))
        }
        #[cfg(not(feature = "detector-ort"))]
        BackendKind::Ort => Err(anyhow!(
            "ONNX face detection requires the `detector-ort` feature"
        )),
    }
}
