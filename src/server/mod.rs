//! HTTP side: the multipart video feed and the focus/status API.
//!
//! Handlers only read the [`FrameHub`]; none of them touch the camera or the
//! detector, so serving cost does not depend on the pipeline.

pub mod mjpeg;
mod routes;

pub use routes::{FocusView, StatusView, create_router};

use std::{
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{hub::FrameHub, worker::PipelineControls};

#[derive(Clone)]
pub struct AppState {
    pub hub: FrameHub,
    pub controls: PipelineControls,
    pub viewers: Arc<AtomicUsize>,
    /// Cadence at which each video viewer checks for a new frame.
    pub serve_interval: Duration,
    /// Cadence of the focus event stream.
    pub status_interval: Duration,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(hub: FrameHub, controls: PipelineControls, serve_interval: Duration) -> Self {
        Self {
            hub,
            controls,
            viewers: Arc::new(AtomicUsize::new(0)),
            serve_interval,
            status_interval: Duration::from_millis(250),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Serves until `state.shutdown` is cancelled. Open streams end on the same
/// token, so graceful shutdown does not wait on viewers.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    let shutdown = state.shutdown.clone();
    log::info!("serving on http://{addr} (video at /api/video_feed)");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;

    log::info!("http server stopped");
    Ok(())
}
