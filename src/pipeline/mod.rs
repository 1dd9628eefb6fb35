pub mod annotator;
pub mod camera;
pub mod detector;
pub mod focus;
pub mod hub;
pub mod rgb_converter;
pub mod synthetic;
pub mod worker;

// Re-exports for convenience
pub use annotator::{Annotator, AnnotatorConfig};
pub use camera::FrameSource;
#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraSettings, CameraSource};
pub use detector::{Detector, DetectorConfig, FaceModel, PlaceholderModel, build_model};
pub use focus::{FocusConfig, FocusStateMachine};
pub use hub::{FrameHub, PipelineHealth, Snapshot};
pub use synthetic::SyntheticSource;
pub use worker::{
    PipelineControls, PipelineHandle, PipelineWorker, SourceOpener, Switch, WorkerConfig,
};

use std::{
    thread,
    time::{Duration, Instant},
};

use crate::config::{Config, SourceKind};

/// Opens the configured frame source.
pub fn open_source(config: &Config) -> anyhow::Result<Box<dyn FrameSource>> {
    match config.source {
        SourceKind::Synthetic => Ok(Box::new(
            SyntheticSource::new(config.frame_width, config.frame_height)
                .with_frame_delay(Duration::from_millis(config.capture_interval_ms / 2))
                .with_absence(300),
        )),
        #[cfg(feature = "camera-nokhwa")]
        SourceKind::Camera => Ok(Box::new(CameraSource::open(CameraSettings {
            index: config.camera_index(),
            width: config.frame_width,
            height: config.frame_height,
            mirror: config.mirror(),
            timeout: config.capture_timeout(),
        })?)),
        #[cfg(not(feature = "camera-nokhwa"))]
        SourceKind::Camera => Err(anyhow::anyhow!(
            "camera capture requires the `camera-nokhwa` feature"
        )),
    }
}

/// Joins `handle` if it finishes within `timeout`. Otherwise the thread is
/// left running detached and `false` is returned.
pub(crate) fn join_within(handle: thread::JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("joined thread panicked");
    }
    true
}
