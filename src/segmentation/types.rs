use crate::error::MaskError;
use anyhow::Result;
use image::RgbImage;

/// Per-pixel foreground confidence: 0.0 = background, 1.0 = foreground
///
/// Values are stored row-major and clamped into 0.0..=1.0 on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceMask {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ConfidenceMask {
    pub fn new(width: u32, height: u32, mut data: Vec<f32>) -> Result<Self, MaskError> {
        if width == 0 || height == 0 {
            return Err(MaskError::EmptyMask);
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(MaskError::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        for value in &mut data {
            *value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn uniform(width: u32, height: u32, value: f32) -> Result<Self, MaskError> {
        Self::new(width, height, vec![value; width as usize * height as usize])
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Where the model should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExecutionPreference {
    Cpu,
    Gpu,
}

/// Supported model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelKind {
    /// MediaPipe selfie segmenter (landscape), single confidence output
    Selfie,
    /// Robust Video Matting with recurrent state
    Rvm,
}

/// Trait for segmentation models
/// Allows swapping between different backends (selfie segmenter, RVM, test doubles)
pub trait SegmentationModel {
    /// Process a frame and return a confidence mask aligned to it
    ///
    /// `timestamp_ms` is the capture time of the frame. `Ok(None)` means the
    /// model ran but produced no mask for this frame.
    fn segment(&mut self, frame: &RgbImage, timestamp_ms: f64) -> Result<Option<ConfidenceMask>>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Call this when switching cameras or starting a new session.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }
}

/// Model that reports the same confidence everywhere
///
/// With 1.0 every pixel counts as subject, so the composite is the sharp
/// input. This is what runs when no model file is configured.
pub struct UniformModel {
    value: f32,
}

impl UniformModel {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl SegmentationModel for UniformModel {
    fn segment(&mut self, frame: &RgbImage, _timestamp_ms: f64) -> Result<Option<ConfidenceMask>> {
        let (width, height) = frame.dimensions();
        Ok(Some(ConfidenceMask::uniform(width, height, self.value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_length_must_match_dimensions() {
        let err = ConfidenceMask::new(3, 2, vec![0.5; 5]).unwrap_err();
        assert_eq!(
            err,
            MaskError::DimensionMismatch {
                expected: 6,
                actual: 5
            }
        );
        assert_eq!(
            ConfidenceMask::new(0, 2, vec![]).unwrap_err(),
            MaskError::EmptyMask
        );
    }

    #[test]
    fn mask_values_are_clamped() {
        let mask = ConfidenceMask::new(2, 2, vec![-0.5, 0.25, 1.5, f32::NAN]).unwrap();
        assert_eq!(mask.as_slice(), &[0.0, 0.25, 1.0, 0.0]);
        assert_eq!(mask.get(1, 0), 0.25);
        assert_eq!(mask.get(0, 1), 1.0);
    }

    #[test]
    fn uniform_model_follows_frame_size() {
        let mut model = UniformModel::new(1.0);
        let frame = RgbImage::new(7, 5);
        let mask = model.segment(&frame, 0.0).unwrap().unwrap();
        assert_eq!(mask.dimensions(), (7, 5));
        assert!(mask.as_slice().iter().all(|&v| v == 1.0));
    }
}
