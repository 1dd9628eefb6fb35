use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

use super::{
    annotator::Annotator,
    camera::FrameSource,
    detector::Detector,
    focus::FocusStateMachine,
    hub::{FrameHub, PipelineHealth},
};
use crate::{
    error::PipelineError,
    types::{DetectionResult, Frame},
};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Target time per iteration.
    pub frame_interval: Duration,
    /// Ceiling for the retry delay after capture failures.
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Runtime on/off flag shared with the HTTP side.
#[derive(Clone, Debug)]
pub struct Switch(Arc<AtomicBool>);

impl Switch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::AcqRel)
    }
}

/// Switches flipped by the HTTP side and applied by the worker at the top of
/// its next iteration.
#[derive(Clone, Debug)]
pub struct PipelineControls {
    /// Face detection; while off, raw frames are published.
    pub tracking: Switch,
    /// Whether the frame source is held. Off releases the device.
    pub camera: Switch,
}

impl Default for PipelineControls {
    fn default() -> Self {
        Self {
            tracking: Switch::new(true),
            camera: Switch::new(true),
        }
    }
}

/// Re-acquires the frame source after the camera was switched off.
pub type SourceOpener = Box<dyn FnMut() -> anyhow::Result<Box<dyn FrameSource>> + Send>;

/// Capture, detect, debounce, annotate and publish, one frame at a time on
/// a dedicated thread. The worker is the only owner of the state machine.
pub struct PipelineWorker {
    source: Option<Box<dyn FrameSource>>,
    opener: Option<SourceOpener>,
    detector: Detector,
    annotator: Annotator,
    focus: FocusStateMachine,
    hub: FrameHub,
    controls: PipelineControls,
    cfg: WorkerConfig,
    health: PipelineHealth,
    last_published: Option<u64>,
    last_captured: Option<u64>,
    /// Added to every sequence of the current source, which restarts at 0
    /// after each reopen.
    sequence_base: u64,
}

impl PipelineWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Detector,
        annotator: Annotator,
        focus: FocusStateMachine,
        hub: FrameHub,
        controls: PipelineControls,
        cfg: WorkerConfig,
    ) -> Self {
        let health = PipelineHealth {
            tracking: controls.tracking.is_enabled(),
            camera_active: true,
            ..PipelineHealth::default()
        };
        Self {
            source: Some(source),
            opener: None,
            detector,
            annotator,
            focus,
            hub,
            controls,
            cfg,
            health,
            last_published: None,
            last_captured: None,
            sequence_base: 0,
        }
    }

    /// Lets the camera switch drop the source and open a fresh one later.
    /// Without an opener, switching the camera off only pauses reading.
    pub fn with_source_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn spawn(self) -> anyhow::Result<PipelineHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("pipeline-worker".into())
            .spawn(move || self.run(stop_rx))?;
        Ok(PipelineHandle {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn run(mut self, stop_rx: Receiver<()>) {
        log::info!(
            "pipeline started: source={} detector={} interval={:?}",
            self.source_name(),
            self.detector.model_name(),
            self.cfg.frame_interval
        );
        let mut backoff = self.cfg.frame_interval;

        loop {
            if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }
            let started = Instant::now();
            self.sync_tracking();

            if !self.controls.camera.is_enabled() {
                self.release_source();
                if !wait(&stop_rx, self.cfg.frame_interval) {
                    break;
                }
                continue;
            }

            let frame = match self.capture() {
                Ok(frame) => {
                    backoff = self.cfg.frame_interval;
                    frame
                }
                Err(err) => {
                    self.health.capture_failures += 1;
                    log::warn!(
                        "capture from {} failed ({} so far), retrying in {backoff:?}: {err}",
                        self.source_name(),
                        self.health.capture_failures
                    );
                    self.focus.record_no_signal();
                    self.hub.publish_status(self.focus.status(), self.health);
                    if !wait(&stop_rx, backoff) {
                        break;
                    }
                    backoff = (backoff * 2).min(self.cfg.max_backoff);
                    continue;
                }
            };

            self.process(&frame);

            let interval = if self.detector.is_degraded() {
                self.cfg.frame_interval * 2
            } else {
                self.cfg.frame_interval
            };
            // Overruns start the next frame immediately; no catching up.
            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                if !wait(&stop_rx, remaining) {
                    break;
                }
            }
        }

        log::info!(
            "pipeline stopped after {} frames; releasing {}",
            self.health.frames_published,
            self.source_name()
        );
    }

    fn source_name(&self) -> &str {
        self.source.as_ref().map_or("frame source", |s| s.name())
    }

    fn sync_tracking(&mut self) {
        let enabled = self.controls.tracking.is_enabled();
        if enabled == self.health.tracking {
            return;
        }
        if enabled {
            log::info!("face tracking resumed");
        } else {
            log::info!("face tracking paused");
            self.focus.reset();
        }
        self.health.tracking = enabled;
    }

    fn release_source(&mut self) {
        if !self.health.camera_active {
            return;
        }
        if self.opener.is_some() {
            if let Some(source) = self.source.take() {
                log::info!("releasing {}", source.name());
            }
        } else {
            log::info!("pausing {}; it cannot be reopened", self.source_name());
        }
        self.health.camera_active = false;
        self.focus.reset();
        self.focus.record_no_signal();
        self.hub.publish_status(self.focus.status(), self.health);
    }

    fn capture(&mut self) -> Result<Frame, PipelineError> {
        if self.source.is_none() {
            let Some(opener) = self.opener.as_mut() else {
                return Err(PipelineError::device("no frame source"));
            };
            let source = (*opener)().map_err(|err| PipelineError::device(format!("{err:#}")))?;
            log::info!("{} acquired", source.name());
            self.sequence_base = self.last_captured.map_or(0, |last| last + 1);
            self.source = Some(source);
        }
        if !self.health.camera_active {
            log::info!("capture resumed from {}", self.source_name());
            self.health.camera_active = true;
        }

        let Some(source) = self.source.as_mut() else {
            return Err(PipelineError::device("no frame source"));
        };
        let mut frame = source.capture()?;
        frame.sequence += self.sequence_base;
        self.last_captured = Some(frame.sequence);
        Ok(frame)
    }

    fn process(&mut self, frame: &Frame) {
        if self
            .last_published
            .is_some_and(|last| frame.sequence <= last)
        {
            log::warn!(
                "dropping out-of-order frame {} (last published {:?})",
                frame.sequence,
                self.last_published
            );
            return;
        }

        let annotated = if self.health.tracking {
            let Some(result) = self.detect(frame) else {
                // The frame is not shown, but it still counts as a miss.
                self.record(&DetectionResult::empty(frame));
                self.health.degraded = self.detector.is_degraded();
                self.hub.publish_status(self.focus.status(), self.health);
                return;
            };
            self.record(&result);
            self.annotator.annotate(frame, &result)
        } else {
            self.annotator.passthrough(frame)
        };
        self.health.degraded = self.detector.is_degraded();

        match annotated {
            Ok(annotated) => {
                self.health.frames_published += 1;
                self.last_published = Some(frame.sequence);
                self.hub.publish(annotated, self.focus.status(), self.health);
            }
            Err(err) => {
                self.health.encoding_failures += 1;
                log::warn!("{err}; keeping previous frame");
                self.hub.publish_status(self.focus.status(), self.health);
            }
        }
    }

    fn record(&mut self, result: &DetectionResult) {
        if let Some(state) = self.focus.record(result) {
            log::info!("focus state now {state:?}");
        }
    }

    /// `None` means the model was busy and the frame is not published.
    fn detect(&mut self, frame: &Frame) -> Option<DetectionResult> {
        match self.detector.detect(frame) {
            Ok(result) => Some(result),
            Err(PipelineError::DetectorBusy { sequence }) => {
                self.health.frames_skipped += 1;
                log::debug!("skipping frame {sequence}, detector busy");
                None
            }
            Err(err @ PipelineError::InferenceTimeout { .. }) => {
                self.health.inference_timeouts += 1;
                log::debug!("{err}");
                Some(DetectionResult::empty(frame))
            }
            Err(err) => {
                log::warn!("{err:#}");
                Some(DetectionResult::empty(frame))
            }
        }
    }
}

/// Sleeps for `duration` unless a stop arrives first. False means stop.
fn wait(stop_rx: &Receiver<()>, duration: Duration) -> bool {
    matches!(
        stop_rx.recv_timeout(duration),
        Err(RecvTimeoutError::Timeout)
    )
}

/// Owner of the worker thread. Stopping (or dropping) it ends the loop at
/// the next check and joins the thread, which releases the frame source.
pub struct PipelineHandle {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
