use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{
    error::ConfigError,
    pipeline::{
        annotator::AnnotatorConfig, detector::DetectorConfig, focus::FocusConfig,
        worker::WorkerConfig,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Physical camera through nokhwa.
    Camera,
    /// Generated frames, no hardware needed.
    Synthetic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// BlazeFace ONNX model through ONNX Runtime.
    Ort,
    /// Brightness heuristic, no model file needed.
    Placeholder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModelVariant {
    /// Faces within ~2 m of the camera.
    ShortRange,
    /// Faces within ~5 m of the camera.
    FullRange,
}

impl ModelVariant {
    pub fn default_model_path(&self) -> PathBuf {
        let file = match self {
            ModelVariant::ShortRange => "face_detection_short_range.onnx",
            ModelVariant::FullRange => "face_detection_full_range.onnx",
        };
        PathBuf::from("models").join(file)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelVariant::ShortRange => "short-range",
            ModelVariant::FullRange => "full-range",
        }
    }
}

const fn default_source() -> SourceKind {
    if cfg!(feature = "camera-nokhwa") {
        SourceKind::Camera
    } else {
        SourceKind::Synthetic
    }
}

const fn default_backend() -> BackendKind {
    if cfg!(feature = "detector-ort") {
        BackendKind::Ort
    } else {
        BackendKind::Placeholder
    }
}

/// Runtime configuration. Every flag can also come from its `FOCUS_*`
/// environment variable.
#[derive(Clone, Debug, Parser)]
#[command(name = "focus-stream", version, about)]
pub struct Config {
    #[arg(long, env = "FOCUS_SOURCE", value_enum, default_value_t = default_source())]
    pub source: SourceKind,

    #[arg(long, env = "FOCUS_CAMERA_INDEX", default_value_t = 0, allow_negative_numbers = true)]
    pub camera_index: i64,

    #[arg(long, env = "FOCUS_FRAME_WIDTH", default_value_t = 640)]
    pub frame_width: u32,

    #[arg(long, env = "FOCUS_FRAME_HEIGHT", default_value_t = 480)]
    pub frame_height: u32,

    /// Publish frames as captured instead of mirrored.
    #[arg(long, env = "FOCUS_NO_MIRROR")]
    pub no_mirror: bool,

    #[arg(long, env = "FOCUS_BACKEND", value_enum, default_value_t = default_backend())]
    pub backend: BackendKind,

    #[arg(long, env = "FOCUS_MODEL_VARIANT", value_enum, default_value_t = ModelVariant::FullRange)]
    pub model_variant: ModelVariant,

    #[arg(long, env = "FOCUS_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Fetched into `model_path` when the file does not exist yet.
    #[arg(long, env = "FOCUS_MODEL_URL")]
    pub model_url: Option<String>,

    #[arg(long, env = "FOCUS_CONFIDENCE_THRESHOLD", default_value_t = 0.7)]
    pub confidence_threshold: f32,

    #[arg(long, env = "FOCUS_MAX_DETECTIONS", default_value_t = 4)]
    pub max_detections: usize,

    #[arg(long, env = "FOCUS_INFERENCE_BUDGET_MS", default_value_t = 250)]
    pub inference_budget_ms: u64,

    /// Consecutive inference timeouts before the pipeline halves its rate.
    #[arg(long, env = "FOCUS_DEGRADE_AFTER", default_value_t = 3)]
    pub degrade_after: u32,

    #[arg(long, env = "FOCUS_CAPTURE_TIMEOUT_MS", default_value_t = 500)]
    pub capture_timeout_ms: u64,

    #[arg(long, env = "FOCUS_CAPTURE_INTERVAL_MS", default_value_t = 33)]
    pub capture_interval_ms: u64,

    #[arg(long, env = "FOCUS_MAX_BACKOFF_MS", default_value_t = 2_000)]
    pub max_backoff_ms: u64,

    #[arg(long, env = "FOCUS_SERVE_INTERVAL_MS", default_value_t = 33)]
    pub serve_interval_ms: u64,

    #[arg(long, env = "FOCUS_WINDOW_SIZE", default_value_t = 10)]
    pub window_size: usize,

    #[arg(long, env = "FOCUS_ENTER_THRESHOLD", default_value_t = 0.6)]
    pub enter_threshold: f32,

    #[arg(long, env = "FOCUS_EXIT_THRESHOLD", default_value_t = 0.2)]
    pub exit_threshold: f32,

    #[arg(long, env = "FOCUS_JPEG_QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,

    #[arg(long, env = "FOCUS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "FOCUS_PORT", default_value_t = 5002)]
    pub port: u16,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("confidence threshold", self.confidence_threshold),
            ("enter threshold", self.enter_threshold),
            ("exit threshold", self.exit_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        if self.enter_threshold <= self.exit_threshold {
            return Err(ConfigError::InvertedHysteresis {
                enter: self.enter_threshold,
                exit: self.exit_threshold,
            });
        }

        for (name, value) in [
            ("window size", self.window_size as u64),
            ("max detections", self.max_detections as u64),
            ("inference budget", self.inference_budget_ms),
            ("degrade after", self.degrade_after as u64),
            ("capture timeout", self.capture_timeout_ms),
            ("capture interval", self.capture_interval_ms),
            ("serve interval", self.serve_interval_ms),
            ("frame width", self.frame_width as u64),
            ("frame height", self.frame_height as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::JpegQuality(self.jpeg_quality));
        }
        if self.camera_index < 0 || self.camera_index > u32::MAX as i64 {
            return Err(ConfigError::CameraIndex(self.camera_index));
        }

        if self.source == SourceKind::Camera && !cfg!(feature = "camera-nokhwa") {
            return Err(ConfigError::Unsupported {
                what: "camera capture",
                feature: "camera-nokhwa",
            });
        }
        if self.backend == BackendKind::Ort && !cfg!(feature = "detector-ort") {
            return Err(ConfigError::Unsupported {
                what: "ONNX face detection",
                feature: "detector-ort",
            });
        }
        if self.backend == BackendKind::Ort {
            let path = self.resolved_model_path();
            if !path.exists() && self.model_url.is_none() {
                return Err(ConfigError::MissingModel {
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn resolved_model_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| self.model_variant.default_model_path())
    }

    pub fn camera_index(&self) -> u32 {
        self.camera_index.clamp(0, u32::MAX as i64) as u32
    }

    pub fn mirror(&self) -> bool {
        !self.no_mirror
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn serve_interval(&self) -> Duration {
        Duration::from_millis(self.serve_interval_ms)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|err| anyhow::anyhow!("invalid listen address {addr}: {err}"))
    }

    pub fn focus(&self) -> FocusConfig {
        FocusConfig {
            window_size: self.window_size,
            enter_threshold: self.enter_threshold,
            exit_threshold: self.exit_threshold,
        }
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            confidence_threshold: self.confidence_threshold,
            max_detections: self.max_detections,
            budget: Duration::from_millis(self.inference_budget_ms),
            degrade_after: self.degrade_after,
        }
    }

    pub fn annotator(&self) -> AnnotatorConfig {
        AnnotatorConfig {
            jpeg_quality: self.jpeg_quality,
            ..AnnotatorConfig::default()
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            frame_interval: Duration::from_millis(self.capture_interval_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.capture_interval_ms)),
        }
    }
}
