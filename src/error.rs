use std::time::Duration;

use thiserror::Error;

/// Recoverable failures inside the capture → detect → annotate → serve path.
///
/// None of these stop the pipeline: the worker logs them and moves on to
/// the next frame, and viewers keep seeing the last good frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("inference for frame {sequence} exceeded its {budget:?} budget")]
    InferenceTimeout { sequence: u64, budget: Duration },

    #[error("detector still busy with an earlier frame, skipping frame {sequence}")]
    DetectorBusy { sequence: u64 },

    #[error("inference failed for frame {sequence}: {source:#}")]
    InferenceFailure {
        sequence: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to encode frame {sequence}: {reason}")]
    EncodingFailure { sequence: u64, reason: String },

    #[error("viewer stream closed: {reason}")]
    StreamWriteFailure { reason: String },
}

impl PipelineError {
    pub fn device(reason: impl Into<String>) -> Self {
        PipelineError::DeviceUnavailable {
            reason: reason.into(),
        }
    }
}

/// Startup configuration problems. Always fatal, reported before the
/// server binds its listener.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },

    #[error("enter threshold ({enter}) must be greater than exit threshold ({exit})")]
    InvertedHysteresis { enter: f32, exit: f32 },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("jpeg quality must be within 1..=100, got {0}")]
    JpegQuality(u8),

    #[error("invalid camera index {0}")]
    CameraIndex(i64),

    #[error("{what} support was not compiled in (enable the `{feature}` feature)")]
    Unsupported {
        what: &'static str,
        feature: &'static str,
    },

    #[error("model file {path} is missing and no download url is configured")]
    MissingModel { path: String },
}
