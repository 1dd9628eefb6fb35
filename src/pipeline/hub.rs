use std::sync::Arc;

use tokio::sync::watch;

use crate::types::{AnnotatedFrame, FocusStatus};

/// Counters published alongside every snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineHealth {
    pub frames_published: u64,
    pub capture_failures: u64,
    pub inference_timeouts: u64,
    pub encoding_failures: u64,
    /// Frames skipped because the model was still busy with an earlier one.
    pub frames_skipped: u64,
    pub tracking: bool,
    /// The frame source is held and being read.
    pub camera_active: bool,
    pub degraded: bool,
}

/// One immutable view of the pipeline output. Readers hold it by `Arc`, so
/// a publish never waits on a slow viewer.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub frame: Option<Arc<AnnotatedFrame>>,
    pub status: FocusStatus,
    pub health: PipelineHealth,
}

/// Latest-value cell between the pipeline worker (single writer) and the
/// stream handlers (many readers).
#[derive(Clone, Debug)]
pub struct FrameHub {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl FrameHub {
    pub fn new() -> Self {
        let initial = Snapshot {
            frame: None,
            status: FocusStatus::initial(),
            health: PipelineHealth {
                tracking: true,
                camera_active: true,
                ..PipelineHealth::default()
            },
        };
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Replaces frame and status in one swap.
    pub fn publish(&self, frame: AnnotatedFrame, status: FocusStatus, health: PipelineHealth) {
        let snapshot = Arc::new(Snapshot {
            frame: Some(Arc::new(frame)),
            status,
            health,
        });
        self.tx.send_replace(snapshot);
    }

    /// Replaces status and counters, carrying the current frame forward.
    pub fn publish_status(&self, status: FocusStatus, health: PipelineHealth) {
        let frame = self.tx.borrow().frame.clone();
        self.tx.send_replace(Arc::new(Snapshot {
            frame,
            status,
            health,
        }));
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Receiver woken on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}
