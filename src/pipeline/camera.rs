use crate::{error::PipelineError, types::Frame};

/// Produces frames for the pipeline. Implementations own their device for
/// their whole lifetime and release it on drop.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Returns the newest frame, waiting no longer than the source's
    /// capture timeout. Sequence numbers strictly increase per source.
    fn capture(&mut self) -> Result<Frame, PipelineError>;
}

#[cfg(feature = "camera-nokhwa")]
pub use self::device::{CameraSettings, CameraSource};

#[cfg(feature = "camera-nokhwa")]
mod device {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use anyhow::{Result, anyhow};
    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
    use nokhwa::{
        Buffer, Camera,
        pixel_format::RgbFormat,
        utils::{
            CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
            Resolution,
        },
    };

    use super::FrameSource;
    use crate::{
        error::PipelineError,
        pipeline::join_within,
        pipeline::rgb_converter::{self, PixelLayout, RgbImage},
        types::Frame,
    };

    // MJPEG first: some built-in webcams advertise YUYV but refuse to stream it.
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::MJPEG,
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
        FrameFormat::GRAY,
        FrameFormat::YUYV,
        FrameFormat::NV12,
    ];

    /// Consecutive read failures before the device is closed and re-opened.
    const REOPEN_AFTER_FAILURES: u32 = 10;
    const REOPEN_COOLDOWN: Duration = Duration::from_secs(1);
    /// Longest drop waits for the capture thread before leaving it behind.
    const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Clone, Debug)]
    pub struct CameraSettings {
        pub index: u32,
        pub width: u32,
        pub height: u32,
        pub mirror: bool,
        pub timeout: Duration,
    }

    fn requested_formats(width: u32, height: u32) -> [RequestedFormat<'static>; 4] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::Closest(CameraFormat::new(
                    Resolution::new(width, height),
                    FrameFormat::MJPEG,
                    30,
                )),
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            // Last resort: anything decodable, highest frame rate first.
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    fn build_camera(settings: &CameraSettings) -> Result<Camera> {
        let mut last_err = None;

        for requested in requested_formats(settings.width, settings.height) {
            match Camera::new(CameraIndex::Index(settings.index), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => return Ok(camera),
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
    }

    fn layout_of(format: FrameFormat) -> PixelLayout {
        match format {
            FrameFormat::NV12 => PixelLayout::Nv12,
            FrameFormat::YUYV => PixelLayout::Yuyv,
            FrameFormat::MJPEG => PixelLayout::Mjpeg,
            FrameFormat::RAWRGB => PixelLayout::Rgb,
            FrameFormat::RAWBGR => PixelLayout::Bgr,
            FrameFormat::GRAY => PixelLayout::Gray,
        }
    }

    fn convert(buffer: &Buffer, mirror: bool) -> Result<RgbImage> {
        let resolution = buffer.resolution();
        rgb_converter::convert_to_rgb(
            layout_of(buffer.source_frame_format()),
            buffer.buffer(),
            resolution.width_x,
            resolution.height_y,
            mirror,
        )
    }

    /// Physical camera read by a dedicated capture thread.
    ///
    /// The thread keeps only the newest converted image in a one-slot
    /// channel; `capture` stamps it with the next sequence number.
    pub struct CameraSource {
        label: String,
        images: Receiver<RgbImage>,
        timeout: Duration,
        next_sequence: u64,
        stop: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl CameraSource {
        pub fn open(settings: CameraSettings) -> Result<Self> {
            // Fail fast before spawning the capture thread.
            let probe = build_camera(&settings)?;
            let label = format!("camera {} ({})", settings.index, probe.info().human_name());
            drop(probe);

            let (image_tx, image_rx) = bounded(1);
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = stop.clone();
            let drain_rx = image_rx.clone();
            let timeout = settings.timeout;

            let handle = thread::Builder::new()
                .name("camera-capture".into())
                .spawn(move || run_capture_loop(settings, image_tx, drain_rx, stop_flag))?;

            log::info!("{label} opened");

            Ok(Self {
                label,
                images: image_rx,
                timeout,
                next_sequence: 0,
                stop,
                handle: Some(handle),
            })
        }
    }

    fn run_capture_loop(
        settings: CameraSettings,
        image_tx: Sender<RgbImage>,
        drain_rx: Receiver<RgbImage>,
        stop: Arc<AtomicBool>,
    ) {
        let mut camera: Option<Camera> = None;
        let mut failures = 0u32;

        while !stop.load(Ordering::Relaxed) {
            let Some(cam) = camera.as_mut() else {
                match build_camera(&settings) {
                    Ok(cam) => {
                        failures = 0;
                        camera = Some(cam);
                    }
                    Err(err) => {
                        log::warn!("failed to open camera {}: {err:?}", settings.index);
                        thread::sleep(REOPEN_COOLDOWN);
                    }
                }
                continue;
            };

            let read_start = Instant::now();
            let image = match cam.frame() {
                Ok(buffer) => convert(&buffer, settings.mirror),
                Err(err) => Err(err.into()),
            };

            match image {
                Ok(image) => {
                    failures = 0;
                    // Replace the pending image so the consumer always sees the newest one.
                    if let Err(TrySendError::Full(image)) = image_tx.try_send(image) {
                        let _ = drain_rx.try_recv();
                        let _ = image_tx.try_send(image);
                    }
                }
                Err(err) => {
                    failures += 1;
                    log::warn!(
                        "camera frame read failed (after {:?}, {failures} in a row): {err:?}",
                        read_start.elapsed()
                    );
                    if failures >= REOPEN_AFTER_FAILURES {
                        log::warn!("re-opening camera {}", settings.index);
                        if let Some(mut cam) = camera.take() {
                            let _ = cam.stop_stream();
                        }
                        thread::sleep(REOPEN_COOLDOWN);
                    }
                }
            }
        }

        if let Some(mut cam) = camera.take() {
            let _ = cam.stop_stream();
        }
        log::info!("camera {} released", settings.index);
    }

    impl FrameSource for CameraSource {
        fn name(&self) -> &str {
            &self.label
        }

        fn capture(&mut self) -> Result<Frame, PipelineError> {
            let mut image = match self.images.recv_timeout(self.timeout) {
                Ok(image) => image,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(PipelineError::device(format!(
                        "no frame within {:?}",
                        self.timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::device("capture thread stopped"));
                }
            };
            while let Ok(newer) = self.images.try_recv() {
                image = newer;
            }

            let sequence = self.next_sequence;
            let frame = Frame::new(sequence, image.width, image.height, 3, image.rgb)
                .map_err(|err| PipelineError::device(format!("{err:#}")))?;
            self.next_sequence += 1;
            Ok(frame)
        }
    }

    impl Drop for CameraSource {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            let Some(handle) = self.handle.take() else {
                return;
            };
            // A read stuck in the driver must not hold up shutdown.
            if !join_within(handle, RELEASE_TIMEOUT) {
                log::warn!(
                    "{} did not stop within {RELEASE_TIMEOUT:?}, detaching",
                    self.label
                );
            }
        }
    }
}
