use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    FaceModel,
    common::{REGRESSOR_FEATURES, decode_detections, generate_anchors, prepare_frame},
};
use crate::{
    config::ModelVariant,
    types::{Detection, Frame},
};

/// BlazeFace exported to ONNX: NHWC input in `[-1, 1]`, a regressor tensor
/// `[1, anchors, 16]` and a score tensor `[1, anchors, 1]`.
pub struct BlazeFaceModel {
    session: Session,
    variant: ModelVariant,
    input_size: u32,
    anchors: Vec<[f32; 2]>,
    score_threshold: f32,
}

fn layout(variant: ModelVariant) -> (u32, &'static [(u32, usize)]) {
    match variant {
        ModelVariant::ShortRange => (128, &[(8, 2), (16, 6)]),
        ModelVariant::FullRange => (192, &[(4, 1)]),
    }
}

impl BlazeFaceModel {
    pub fn load(model_path: &Path, variant: ModelVariant, score_threshold: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load face detector from {}", model_path.display())
            })?;

        let (input_size, layers) = layout(variant);
        let anchors = generate_anchors(input_size, layers);
        log::info!(
            "loaded {} BlazeFace model from {} ({} anchors)",
            variant.label(),
            model_path.display(),
            anchors.len()
        );

        Ok(Self {
            session,
            variant,
            input_size,
            anchors,
            score_threshold,
        })
    }
}

impl FaceModel for BlazeFaceModel {
    fn name(&self) -> &'static str {
        match self.variant {
            ModelVariant::ShortRange => "blazeface-short-range",
            ModelVariant::FullRange => "blazeface-full-range",
        }
    }

    fn run_inference(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, letterbox) = prepare_frame(frame, self.input_size)?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run face detector session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "face detector returned {} outputs, expected 2",
                outputs.len()
            ));
        }

        let first = outputs[0].try_extract_array::<f32>()?;
        let second = outputs[1].try_extract_array::<f32>()?;
        // Exporters disagree on output order; the regressors are the wide one.
        let (regressors, scores) = if first.shape().last() == Some(&REGRESSOR_FEATURES) {
            (first, second)
        } else {
            (second, first)
        };

        decode_detections(
            regressors
                .as_slice()
                .ok_or_else(|| anyhow!("face regressors not contiguous"))?,
            scores
                .as_slice()
                .ok_or_else(|| anyhow!("face scores not contiguous"))?,
            &self.anchors,
            self.input_size,
            &letterbox,
            self.score_threshold,
        )
    }
}
