use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{ConfidenceMask, ExecutionPreference, ModelKind, SegmentationModel};
use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{arr1, ArrayD, IxDyn};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// MediaPipe's landscape selfie segmenter takes 256x144 input
const SELFIE_INPUT: (u32, u32) = (256, 144);
const RVM_INPUT: (u32, u32) = (512, 288);
const RVM_DOWNSAMPLE_RATIO: f32 = 0.25;

/// Recurrent hidden states carried between RVM frames
struct RecurrentState {
    r1: ArrayD<f32>,
    r2: ArrayD<f32>,
    r3: ArrayD<f32>,
    r4: ArrayD<f32>,
}

impl RecurrentState {
    /// RVM accepts 1x1x1x1 zero tensors as the initial state
    fn zeros() -> Self {
        let zero = || ArrayD::<f32>::zeros(IxDyn(&[1, 1, 1, 1]));
        Self {
            r1: zero(),
            r2: zero(),
            r3: zero(),
            r4: zero(),
        }
    }
}

/// Segmentation backed by an ONNX Runtime session
pub struct OnnxSegmenter {
    session: Session,
    kind: ModelKind,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
    state: Option<RecurrentState>,
}

impl OnnxSegmenter {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        kind: ModelKind,
        preference: ExecutionPreference,
    ) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!(
            "Loading {:?} model from {} ({:?} preferred)",
            kind,
            path.display(),
            preference
        );

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        if preference == ExecutionPreference::Gpu {
            // Falls back to the CPU provider when CUDA cannot be registered
            builder =
                builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        }

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        let ((width, height), layout) = match kind {
            ModelKind::Selfie => (SELFIE_INPUT, TensorLayout::Nhwc),
            ModelKind::Rvm => (RVM_INPUT, TensorLayout::Nchw),
        };

        tracing::info!("Model loaded, input {}x{}", width, height);

        Ok(Self {
            session,
            kind,
            preprocessor: Preprocessor::new(width, height, layout),
            width,
            height,
            state: None,
        })
    }

    fn run_selfie(&mut self, frame: &RgbImage) -> Result<Vec<f32>> {
        let input = self.preprocessor.preprocess(frame);

        let _span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])
            .context("Failed to run inference")?;

        let confidence = outputs[0].try_extract_array::<f32>()?;
        Ok(confidence.iter().copied().collect())
    }

    fn run_rvm(&mut self, frame: &RgbImage) -> Result<Vec<f32>> {
        let input = self.preprocessor.preprocess(frame);
        let ratio = arr1(&[RVM_DOWNSAMPLE_RATIO]);
        let state = self.state.get_or_insert_with(RecurrentState::zeros);

        let _span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![
                "src" => TensorRef::from_array_view(input.view())?,
                "r1i" => TensorRef::from_array_view(state.r1.view())?,
                "r2i" => TensorRef::from_array_view(state.r2.view())?,
                "r3i" => TensorRef::from_array_view(state.r3.view())?,
                "r4i" => TensorRef::from_array_view(state.r4.view())?,
                "downsample_ratio" => TensorRef::from_array_view(ratio.view())?,
            ])
            .context("Failed to run inference")?;

        let pha: Vec<f32> = outputs["pha"].try_extract_array::<f32>()?.iter().copied().collect();
        let next = RecurrentState {
            r1: outputs["r1o"].try_extract_array::<f32>()?.to_owned(),
            r2: outputs["r2o"].try_extract_array::<f32>()?.to_owned(),
            r3: outputs["r3o"].try_extract_array::<f32>()?.to_owned(),
            r4: outputs["r4o"].try_extract_array::<f32>()?.to_owned(),
        };
        drop(outputs);

        self.state = Some(next);
        Ok(pha)
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn segment(&mut self, frame: &RgbImage, _timestamp_ms: f64) -> Result<Option<ConfidenceMask>> {
        let _span = tracing::debug_span!("onnx_segment", kind = ?self.kind).entered();

        let values = match self.kind {
            ModelKind::Selfie => self.run_selfie(frame)?,
            ModelKind::Rvm => self.run_rvm(frame)?,
        };

        if values.is_empty() {
            return Ok(None);
        }
        anyhow::ensure!(
            values.len() == (self.width * self.height) as usize,
            "model returned {} mask values for a {}x{} input",
            values.len(),
            self.width,
            self.height
        );

        let (frame_width, frame_height) = frame.dimensions();
        let mask = Preprocessor::resize_mask(
            values,
            self.width,
            self.height,
            frame_width,
            frame_height,
        )?;

        Ok(Some(mask))
    }

    fn reset_state(&mut self) {
        if self.state.take().is_some() {
            tracing::info!("Resetting RVM hidden states");
        }
    }
}
