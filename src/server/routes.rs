//! API routes

use std::{
    convert::Infallible,
    sync::atomic::{AtomicU64, Ordering},
};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, stream};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::{
    AppState,
    mjpeg::{self, ViewerGuard},
};
use crate::{error::PipelineError, pipeline::hub::Snapshot};

static NEXT_VIEWER_ID: AtomicU64 = AtomicU64::new(1);

/// Focus status as served to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FocusView {
    pub focused: bool,
    pub confidence: f32,
    /// Unix seconds of the last state change.
    pub since: f64,
    pub signal: bool,
    /// Whether the latest processed frame had a face, before debouncing.
    pub face_detected: bool,
    pub sequence: Option<u64>,
}

/// Whether `next` is worth pushing to event-stream clients. Raw per-frame
/// presence flickers, so only the debounced fields count.
fn focus_changed(prev: &FocusView, next: &FocusView) -> bool {
    prev.focused != next.focused
        || prev.signal != next.signal
        || (prev.confidence - next.confidence).abs() >= 0.05
}

impl From<&Snapshot> for FocusView {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            focused: snapshot.status.is_focused(),
            confidence: (snapshot.status.confidence * 1000.0).round() / 1000.0,
            since: snapshot.status.since_unix_secs(),
            signal: snapshot.status.signal,
            face_detected: snapshot.status.face_detected,
            sequence: snapshot.frame.as_ref().map(|f| f.sequence),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusView {
    pub running: bool,
    pub camera_active: bool,
    pub camera_signal: bool,
    pub tracking: bool,
    pub degraded: bool,
    pub viewers: usize,
    pub frames_published: u64,
    pub capture_failures: u64,
    pub inference_timeouts: u64,
    pub frames_skipped: u64,
    pub encoding_failures: u64,
    pub version: &'static str,
}

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/video_feed", get(video_feed))
        .route("/api/focus", get(focus))
        .route("/api/focus/stream", get(focus_stream))
        .route("/api/status", get(status))
        .route("/api/tracking/start", post(start_tracking))
        .route("/api/tracking/stop", post(stop_tracking))
        .route("/api/camera/start", post(start_camera))
        .route("/api/camera/stop", post(stop_camera))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn video_feed(State(state): State<AppState>) -> Response {
    let guard = ViewerGuard::new(
        state.viewers.clone(),
        NEXT_VIEWER_ID.fetch_add(1, Ordering::Relaxed),
    );
    let parts = mjpeg::frame_stream(
        state.hub.clone(),
        state.serve_interval,
        state.shutdown.child_token(),
        guard,
    );

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(mjpeg::CONTENT_TYPE),
            ),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

async fn focus(State(state): State<AppState>) -> Json<FocusView> {
    Json(FocusView::from(state.hub.current().as_ref()))
}

async fn focus_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut ticker = tokio::time::interval(state.status_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = state.shutdown.child_token();
    let initial = (state.hub.clone(), ticker, None::<FocusView>, shutdown);

    let events = stream::unfold(initial, |(hub, mut ticker, mut last, shutdown)| async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let view = FocusView::from(hub.current().as_ref());
            if !last.as_ref().is_none_or(|prev| focus_changed(prev, &view)) {
                continue;
            }

            match Event::default().event("focus").json_data(&view) {
                Ok(event) => {
                    last = Some(view);
                    return Some((Ok(event), (hub, ticker, last, shutdown)));
                }
                Err(err) => {
                    let err = PipelineError::StreamWriteFailure {
                        reason: err.to_string(),
                    };
                    log::warn!("{err}");
                    return None;
                }
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn status(State(state): State<AppState>) -> Json<StatusView> {
    let snapshot = state.hub.current();
    let health = snapshot.health;
    Json(StatusView {
        running: !state.shutdown.is_cancelled(),
        camera_active: health.camera_active,
        camera_signal: snapshot.status.signal,
        tracking: state.controls.tracking.is_enabled(),
        degraded: health.degraded,
        viewers: state.viewers.load(Ordering::Acquire),
        frames_published: health.frames_published,
        capture_failures: health.capture_failures,
        inference_timeouts: health.inference_timeouts,
        frames_skipped: health.frames_skipped,
        encoding_failures: health.encoding_failures,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn start_tracking(State(state): State<AppState>) -> impl IntoResponse {
    set_tracking(&state, true)
}

async fn stop_tracking(State(state): State<AppState>) -> impl IntoResponse {
    set_tracking(&state, false)
}

fn set_tracking(state: &AppState, enabled: bool) -> Json<serde_json::Value> {
    let previous = state.controls.tracking.set(enabled);
    if previous != enabled {
        log::info!(
            "face tracking {} by request",
            if enabled { "enabled" } else { "disabled" }
        );
    }
    Json(json!({
        "tracking": enabled,
        "changed": previous != enabled,
    }))
}

async fn start_camera(State(state): State<AppState>) -> impl IntoResponse {
    set_camera(&state, true)
}

async fn stop_camera(State(state): State<AppState>) -> impl IntoResponse {
    set_camera(&state, false)
}

/// The worker acquires or releases the device on its next iteration;
/// `camera_active` on `/api/status` reports when that happened.
fn set_camera(state: &AppState, enabled: bool) -> Json<serde_json::Value> {
    let previous = state.controls.camera.set(enabled);
    if previous != enabled {
        log::info!(
            "camera {} by request",
            if enabled { "started" } else { "stopped" }
        );
    }
    Json(json!({
        "camera": enabled,
        "changed": previous != enabled,
    }))
}
