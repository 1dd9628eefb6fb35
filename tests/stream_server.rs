use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use focus_stream::{
    pipeline::{FrameHub, PipelineControls, PipelineHealth},
    server::{self, AppState, mjpeg},
    types::{AnnotatedFrame, FocusState, FocusStatus},
};
use serde_json::Value;
use tokio::{net::TcpListener, task::JoinHandle, time::Instant};

struct TestServer {
    base: String,
    state: AppState,
    /// What the publisher task reports as the focus state.
    focused: Arc<AtomicBool>,
    server: JoinHandle<anyhow::Result<()>>,
    publisher: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let hub = FrameHub::new();
        let mut state = AppState::new(
            hub.clone(),
            PipelineControls::default(),
            Duration::from_millis(5),
        );
        state.status_interval = Duration::from_millis(10);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(server::serve(listener, state.clone()));

        let focused = Arc::new(AtomicBool::new(true));
        let publisher_focused = focused.clone();
        let publisher = tokio::spawn(async move {
            let mut sequence = 0u64;
            loop {
                let status = if publisher_focused.load(Ordering::SeqCst) {
                    FocusStatus {
                        state: FocusState::Focused,
                        confidence: 0.9,
                        face_detected: true,
                        ..FocusStatus::initial()
                    }
                } else {
                    FocusStatus {
                        confidence: 0.1,
                        ..FocusStatus::initial()
                    }
                };
                let health = PipelineHealth {
                    frames_published: sequence + 1,
                    tracking: true,
                    camera_active: true,
                    ..PipelineHealth::default()
                };
                hub.publish(
                    AnnotatedFrame {
                        sequence,
                        width: 2,
                        height: 2,
                        jpeg: Bytes::from(vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9]),
                    },
                    status,
                    health,
                );
                sequence += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        Self {
            base,
            state,
            focused,
            server,
            publisher,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn shutdown(self) {
        self.publisher.abort();
        self.state.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Reads until at least `parts` multipart boundaries arrived.
async fn read_parts(response: &mut reqwest::Response, parts: usize) {
    let marker = b"--frame\r\n";
    let mut buf: Vec<u8> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let count = buf
            .windows(marker.len())
            .filter(|w| *w == marker.as_slice())
            .count();
        if count >= parts {
            return;
        }
        assert!(Instant::now() < deadline, "stream stalled");
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("no chunk")
            .unwrap()
            .expect("stream ended early");
        buf.extend_from_slice(&chunk);
    }
}

/// Reads until at least `events` focus events arrived, returning their
/// data lines in order.
async fn read_events(
    response: &mut reqwest::Response,
    text: &mut String,
    events: usize,
) -> Vec<Value> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let data: Vec<Value> = text
            .split("\n\n")
            .filter(|block| block.lines().any(|line| line == "event: focus"))
            .filter_map(|block| block.lines().find_map(|line| line.strip_prefix("data: ")))
            .filter_map(|data| serde_json::from_str(data).ok())
            .collect();
        if data.len() >= events {
            return data;
        }
        assert!(Instant::now() < deadline, "event stream stalled");
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .expect("no chunk")
            .unwrap()
            .expect("event stream ended early");
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }
}

async fn json(response: reqwest::Response) -> Value {
    serde_json::from_slice(&response.bytes().await.unwrap()).unwrap()
}

async fn viewers(client: &reqwest::Client, server: &TestServer) -> u64 {
    let response = client
        .get(server.url("/api/status"))
        .send()
        .await
        .unwrap();
    json(response).await["viewers"].as_u64().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn video_feed_is_multipart_jpeg() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let mut response = client.get(server.url("/api/video_feed")).send().await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        mjpeg::CONTENT_TYPE
    );
    read_parts(&mut response, 3).await;

    drop(response);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnecting_viewer_does_not_affect_others() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let mut first = client.get(server.url("/api/video_feed")).send().await.unwrap();
    let mut second = client.get(server.url("/api/video_feed")).send().await.unwrap();
    read_parts(&mut first, 2).await;
    read_parts(&mut second, 2).await;
    assert_eq!(viewers(&client, &server).await, 2);

    drop(first);
    let deadline = Instant::now() + Duration::from_secs(5);
    while viewers(&client, &server).await != 1 {
        assert!(Instant::now() < deadline, "disconnect not noticed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    read_parts(&mut second, 5).await;
    drop(second);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn focus_endpoint_reports_published_status() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let response = client
        .get(server.url("/api/focus"))
        .header("Origin", "http://example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers()["access-control-allow-origin"]
            .to_str()
            .unwrap(),
        "*"
    );
    let focus = json(response).await;
    assert_eq!(focus["focused"], Value::Bool(true));
    assert_eq!(focus["signal"], Value::Bool(true));
    assert_eq!(focus["face_detected"], Value::Bool(true));
    assert!(focus["sequence"].as_u64().is_some());
    assert!(focus["since"].as_f64().unwrap() > 0.0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tracking_can_be_toggled() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let stopped = json(
        client
            .post(server.url("/api/tracking/stop"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(stopped["tracking"], Value::Bool(false));
    assert_eq!(stopped["changed"], Value::Bool(true));
    assert!(!server.state.controls.tracking.is_enabled());

    let again = json(
        client
            .post(server.url("/api/tracking/stop"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(again["changed"], Value::Bool(false));

    client
        .post(server.url("/api/tracking/start"))
        .send()
        .await
        .unwrap();
    assert!(server.state.controls.tracking.is_enabled());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_ends_open_streams() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let mut response = client.get(server.url("/api/video_feed")).send().await.unwrap();
    read_parts(&mut response, 1).await;

    let state = server.state.clone();
    server.shutdown().await;
    assert!(state.shutdown.is_cancelled());

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match response.chunk().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "stream kept running after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn focus_stream_pushes_only_changes_and_ends_on_shutdown() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut response = client
        .get(server.url("/api/focus/stream"))
        .send()
        .await
        .unwrap();
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let mut text = String::new();
    let events = read_events(&mut response, &mut text, 1).await;
    assert_eq!(events[0]["focused"], Value::Bool(true));

    // Many publishes and status ticks with the same state: nothing is pushed.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let quiet = tokio::time::timeout(Duration::from_millis(100), response.chunk()).await;
    assert!(quiet.is_err(), "unchanged status was pushed again");

    server.focused.store(false, Ordering::SeqCst);
    let events = read_events(&mut response, &mut text, 2).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["focused"], Value::Bool(false));
    assert!((events[1]["confidence"].as_f64().unwrap() - 0.1).abs() < 1e-6);

    server.shutdown().await;
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match response.chunk().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "event stream kept running after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn camera_can_be_released_and_requested() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let stopped = json(
        client
            .post(server.url("/api/camera/stop"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(stopped["camera"], Value::Bool(false));
    assert_eq!(stopped["changed"], Value::Bool(true));
    assert!(!server.state.controls.camera.is_enabled());

    let started = json(
        client
            .post(server.url("/api/camera/start"))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(started["changed"], Value::Bool(true));
    assert!(server.state.controls.camera.is_enabled());

    let status = json(client.get(server.url("/api/status")).send().await.unwrap()).await;
    assert_eq!(status["camera_active"], Value::Bool(true));

    server.shutdown().await;
}
