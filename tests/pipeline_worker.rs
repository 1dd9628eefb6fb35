use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use focus_stream::{
    error::PipelineError,
    pipeline::{
        Annotator, AnnotatorConfig, Detector, DetectorConfig, FaceModel, FocusConfig,
        FocusStateMachine, FrameHub, FrameSource, PipelineControls, PipelineHandle,
        PipelineWorker, PlaceholderModel, WorkerConfig,
    },
    types::{BoundingBox, Detection, Frame},
};

#[derive(Clone, Copy, Debug)]
enum Step {
    Frame,
    Fail,
}

/// What the hub held when the source was asked for another frame.
#[derive(Clone, Copy, Debug)]
struct Observation {
    call: usize,
    published: Option<u64>,
    signal: bool,
}

/// Follows a script, then keeps producing frames.
struct ScriptedSource {
    script: Vec<Step>,
    calls: usize,
    next_sequence: u64,
    hub: FrameHub,
    observations: Observations,
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capture(&mut self) -> Result<Frame, PipelineError> {
        let snapshot = self.hub.current();
        self.observations.lock().unwrap().push(Observation {
            call: self.calls,
            published: snapshot.frame.as_ref().map(|f| f.sequence),
            signal: snapshot.status.signal,
        });

        let step = self.script.get(self.calls).copied().unwrap_or(Step::Frame);
        self.calls += 1;
        match step {
            Step::Fail => Err(PipelineError::device("scripted failure")),
            Step::Frame => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                let mut rgb = vec![20u8; 32 * 24 * 3];
                for y in 6..18 {
                    for x in 10..22 {
                        let idx = (y * 32 + x) * 3;
                        rgb[idx..idx + 3].fill(240);
                    }
                }
                Ok(Frame::new(sequence, 32, 24, 3, rgb).unwrap())
            }
        }
    }
}

type Observations = Arc<Mutex<Vec<Observation>>>;

fn spawn_pipeline(script: Vec<Step>) -> (FrameHub, Observations, PipelineHandle) {
    spawn_pipeline_with(
        script,
        Box::new(PlaceholderModel::default()),
        DetectorConfig::default(),
    )
}

fn spawn_pipeline_with(
    script: Vec<Step>,
    model: Box<dyn FaceModel>,
    detector_cfg: DetectorConfig,
) -> (FrameHub, Observations, PipelineHandle) {
    let hub = FrameHub::new();
    let observations = Arc::new(Mutex::new(Vec::new()));
    let source = ScriptedSource {
        script,
        calls: 0,
        next_sequence: 0,
        hub: hub.clone(),
        observations: observations.clone(),
    };
    let detector = Detector::spawn(model, detector_cfg).unwrap();
    let handle = PipelineWorker::new(
        Box::new(source),
        detector,
        Annotator::new(AnnotatorConfig::default()),
        FocusStateMachine::new(FocusConfig::default()),
        hub.clone(),
        PipelineControls::default(),
        WorkerConfig {
            frame_interval: Duration::from_millis(2),
            max_backoff: Duration::from_millis(8),
        },
    )
    .spawn()
    .unwrap();
    (hub, observations, handle)
}

#[test]
fn unavailable_camera_is_retried_and_last_frame_retained() {
    let (hub, observations, handle) = spawn_pipeline(vec![
        Step::Frame,
        Step::Frame,
        Step::Frame,
        Step::Fail,
        Step::Fail,
        Step::Fail,
        Step::Frame,
    ]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.current().health.frames_published < 20 {
        assert!(Instant::now() < deadline, "pipeline stalled after failures");
        thread::sleep(Duration::from_millis(2));
    }
    handle.stop();

    let observations = observations.lock().unwrap().clone();
    // Calls 4 and 5 follow failures: frame 2 stays published, signal is down.
    for obs in &observations[4..=5] {
        assert_eq!(obs.published, Some(2), "{obs:?}");
        assert!(!obs.signal, "{obs:?}");
    }
    // Call 6 yields a frame, so call 7 sees it and the signal back.
    let after = observations.iter().find(|o| o.call == 7).unwrap();
    assert_eq!(after.published, Some(3));
    assert!(after.signal);

    let health = hub.current().health;
    assert_eq!(health.capture_failures, 3);
}

#[test]
fn published_sequences_strictly_increase() {
    let (hub, _observations, handle) = spawn_pipeline(Vec::new());
    let mut rx = hub.subscribe();

    let mut seen: Vec<u64> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < 30 {
        assert!(Instant::now() < deadline, "too few frames published");
        if rx.has_changed().unwrap_or(false) {
            let snapshot = rx.borrow_and_update().clone();
            if let Some(frame) = &snapshot.frame {
                if seen.last() != Some(&frame.sequence) {
                    seen.push(frame.sequence);
                }
            }
        } else {
            thread::sleep(Duration::from_micros(200));
        }
    }
    handle.stop();

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert!(hub.current().status.is_focused());
}

/// Finds a face on its first `answers` calls, then never returns in time.
struct StallingModel {
    answers: usize,
    calls: usize,
}

impl FaceModel for StallingModel {
    fn name(&self) -> &'static str {
        "stalling"
    }

    fn run_inference(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        self.calls += 1;
        if self.calls > self.answers {
            thread::sleep(Duration::from_secs(30));
        }
        Ok(vec![Detection {
            bbox: BoundingBox::from_corners(0.0, 0.0, frame.width as f32, frame.height as f32),
            confidence: 0.95,
            keypoints: Vec::new(),
        }])
    }
}

#[test]
fn stalled_model_drops_focus_and_degrades() {
    let (hub, _observations, handle) = spawn_pipeline_with(
        Vec::new(),
        Box::new(StallingModel {
            answers: 15,
            calls: 0,
        }),
        DetectorConfig {
            budget: Duration::from_millis(20),
            ..DetectorConfig::default()
        },
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while !hub.current().status.is_focused() {
        assert!(Instant::now() < deadline, "never focused");
        thread::sleep(Duration::from_millis(2));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.current().status.is_focused() {
        assert!(Instant::now() < deadline, "focus held by a stalled model");
        thread::sleep(Duration::from_millis(2));
    }
    let snapshot = hub.current();
    handle.stop();

    assert!(!snapshot.status.face_detected);
    assert!(snapshot.status.signal);
    assert_eq!(snapshot.health.inference_timeouts, 1);
    assert!(snapshot.health.frames_skipped >= 7);
    assert!(snapshot.health.degraded);
    assert!(snapshot.health.frames_published <= 16);
}
