use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use focus_stream::{
    config::Config,
    pipeline::{
        self, Annotator, Detector, FocusStateMachine, FrameHub, PipelineControls, PipelineWorker,
    },
    server::{self, AppState},
};

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();
    if let Err(err) = config.validate() {
        log::error!("invalid configuration: {err}");
        return Err(err.into());
    }
    let listen_addr = config.listen_addr()?;

    // Model download and camera probing block, so they run before the runtime starts.
    let model = pipeline::build_model(&config).context("failed to load face detector")?;
    let detector = Detector::spawn(model, config.detector())?;
    let source = pipeline::open_source(&config).context("failed to open frame source")?;

    let hub = FrameHub::new();
    let controls = PipelineControls::default();
    let reopen_config = config.clone();
    let worker = PipelineWorker::new(
        source,
        detector,
        Annotator::new(config.annotator()),
        FocusStateMachine::new(config.focus()),
        hub.clone(),
        controls.clone(),
        config.worker(),
    )
    .with_source_opener(Box::new(move || pipeline::open_source(&reopen_config)));
    let pipeline = worker.spawn()?;

    let state = AppState::new(hub, controls, config.serve_interval());
    let shutdown = state.shutdown.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let served = runtime.block_on(async move {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind {listen_addr}"))?;

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("shutdown requested"),
                Err(err) => {
                    log::error!("failed to listen for ctrl-c: {err}");
                    return;
                }
            }
            shutdown.cancel();
        });

        server::serve(listener, state).await
    });

    pipeline.stop();
    log::info!("bye");
    served
}
