use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, stream};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pipeline::hub::FrameHub;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One multipart part carrying a JPEG image.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Counts a connected viewer for as long as it lives. Dropped together
/// with the response body when the client goes away.
pub struct ViewerGuard {
    viewers: Arc<AtomicUsize>,
    id: u64,
}

impl ViewerGuard {
    pub fn new(viewers: Arc<AtomicUsize>, id: u64) -> Self {
        let active = viewers.fetch_add(1, Ordering::AcqRel) + 1;
        log::info!("viewer {id} connected ({active} active)");
        Self { viewers, id }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let active = self.viewers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        log::info!("viewer {} disconnected ({active} active)", self.id);
    }
}

struct ViewerState {
    hub: FrameHub,
    ticker: Interval,
    last_sequence: Option<u64>,
    shutdown: CancellationToken,
    _guard: ViewerGuard,
}

/// Multipart body for one viewer. Polls the hub at `interval` and emits a
/// part only when a newer frame is there; a slow client simply misses
/// frames. Ends when `shutdown` fires.
pub fn frame_stream(
    hub: FrameHub,
    interval: Duration,
    shutdown: CancellationToken,
    guard: ViewerGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let state = ViewerState {
        hub,
        ticker,
        last_sequence: None,
        shutdown,
        _guard: guard,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => return None,
                _ = state.ticker.tick() => {}
            }

            let snapshot = state.hub.current();
            let Some(frame) = snapshot.frame.as_ref() else {
                continue;
            };
            if state.last_sequence == Some(frame.sequence) {
                continue;
            }
            state.last_sequence = Some(frame.sequence);
            let part = encode_part(&frame.jpeg);
            return Some((Ok(part), state));
        }
    })
}
