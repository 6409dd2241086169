mod onnx;
mod preprocess;
pub mod types;

pub use onnx::OnnxSegmenter;
pub use preprocess::Preprocessor;
pub use types::{ConfidenceMask, ExecutionPreference, ModelKind, SegmentationModel, UniformModel};

use crate::error::SessionError;
use anyhow::Result;
use image::RgbImage;
use std::path::Path;

/// A loaded model running in video mode
///
/// Frames must arrive with strictly increasing timestamps, and every mask
/// handed back is aligned to the frame it was computed from.
pub struct ModelSession {
    model: Box<dyn SegmentationModel>,
    last_timestamp_ms: Option<f64>,
}

impl ModelSession {
    /// Load a model file and prepare it for the requested execution target
    pub fn load<P: AsRef<Path>>(
        location: P,
        kind: ModelKind,
        preference: ExecutionPreference,
    ) -> Result<Self> {
        let model = OnnxSegmenter::new(location, kind, preference)?;
        Ok(Self::from_model(Box::new(model)))
    }

    /// Session that treats the whole frame as subject
    pub fn passthrough() -> Self {
        Self::from_model(Box::new(UniformModel::new(1.0)))
    }

    pub fn from_model(model: Box<dyn SegmentationModel>) -> Self {
        Self {
            model,
            last_timestamp_ms: None,
        }
    }

    pub fn segment(&mut self, frame: &RgbImage, timestamp_ms: f64) -> Result<Option<ConfidenceMask>> {
        if let Some(previous_ms) = self.last_timestamp_ms {
            if timestamp_ms <= previous_ms {
                return Err(SessionError::NonMonotonicTimestamp {
                    previous_ms,
                    current_ms: timestamp_ms,
                }
                .into());
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let Some(mask) = self.model.segment(frame, timestamp_ms)? else {
            return Ok(None);
        };

        let (width, height) = frame.dimensions();
        if mask.dimensions() == (width, height) {
            return Ok(Some(mask));
        }

        tracing::debug!(
            "Realigning {:?} mask to {}x{} frame",
            mask.dimensions(),
            width,
            height
        );
        let (mask_width, mask_height) = mask.dimensions();
        let values = mask.as_slice().to_vec();
        Preprocessor::resize_mask(values, mask_width, mask_height, width, height).map(Some)
    }

    /// Forget temporal state, e.g. after switching input
    pub fn reset(&mut self) {
        self.model.reset_state();
        self.last_timestamp_ms = None;
    }
}
