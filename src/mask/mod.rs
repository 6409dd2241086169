//! Turning confidence masks into drawable bitmaps.
//!
//! The copy writes the confidence channel into every output channel, so the
//! bitmap's alpha equals the mask value at each pixel and the result can seed
//! the alpha channel of a 2D composite.

mod wgpu_copier;

pub use wgpu_copier::GpuMaskCopier;

use crate::error::SetupError;
use crate::segmentation::ConfidenceMask;
use anyhow::Result;
use image::{Rgba, RgbaImage};

/// Where the confidence mask is turned into a drawable bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CopierKind {
    Gpu,
    Cpu,
}

/// Trait for mask-to-bitmap copiers
pub trait MaskCopier {
    /// Render `mask` into an immutable RGBA bitmap of the same size
    fn copy(&mut self, mask: &ConfidenceMask) -> Result<RgbaImage>;
}

/// Quantize a confidence value the way a unorm8 render target does
pub fn confidence_to_unorm(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// CPU implementation of the grayscale-as-alpha copy
#[derive(Debug, Default)]
pub struct CpuMaskCopier;

impl MaskCopier for CpuMaskCopier {
    fn copy(&mut self, mask: &ConfidenceMask) -> Result<RgbaImage> {
        let _span = tracing::debug_span!("mask_copy_cpu").entered();
        let (width, height) = mask.dimensions();
        Ok(RgbaImage::from_fn(width, height, |x, y| {
            let a = confidence_to_unorm(mask.get(x, y));
            Rgba([a, a, a, a])
        }))
    }
}

/// Build the requested copier
///
/// A GPU request falls back to the CPU copier when no adapter exists. Shader
/// or pipeline failures are returned, since they mean the copy program itself
/// is broken.
pub fn select_copier<F>(kind: CopierKind, gpu_setup: F) -> Result<Box<dyn MaskCopier>, SetupError>
where
    F: FnOnce() -> Result<GpuMaskCopier, SetupError>,
{
    match kind {
        CopierKind::Cpu => Ok(Box::new(CpuMaskCopier)),
        CopierKind::Gpu => match gpu_setup() {
            Ok(copier) => Ok(Box::new(copier)),
            Err(SetupError::NoAdapter) => {
                tracing::warn!("No GPU adapter found, copying masks on the CPU");
                Ok(Box::new(CpuMaskCopier))
            }
            Err(err) => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_matches_mask_everywhere() {
        let values: Vec<f32> = (0..12).map(|i| i as f32 / 11.0).collect();
        let mask = ConfidenceMask::new(4, 3, values).unwrap();
        let bitmap = CpuMaskCopier.copy(&mask).unwrap();

        assert_eq!(bitmap.dimensions(), (4, 3));
        for (x, y, pixel) in bitmap.enumerate_pixels() {
            let expected = confidence_to_unorm(mask.get(x, y));
            assert_eq!(pixel.0, [expected; 4], "pixel ({x}, {y})");
        }
    }

    #[test]
    fn copy_is_not_flipped() {
        let mut values = vec![0.0; 4];
        values[0] = 1.0;
        let mask = ConfidenceMask::new(2, 2, values).unwrap();
        let bitmap = CpuMaskCopier.copy(&mask).unwrap();
        assert_eq!(bitmap.get_pixel(0, 0).0, [255; 4]);
        assert_eq!(bitmap.get_pixel(0, 1).0, [0; 4]);
    }

    #[test]
    fn missing_adapter_falls_back_to_cpu() {
        let mut copier = match select_copier(CopierKind::Gpu, || Err(SetupError::NoAdapter)) {
            Ok(copier) => copier,
            Err(err) => panic!("expected a CPU fallback, got {err}"),
        };

        let mask = ConfidenceMask::uniform(3, 2, 0.5).unwrap();
        let bitmap = copier.copy(&mask).unwrap();
        assert!(bitmap.pixels().all(|p| p.0 == [128; 4]));
    }

    #[test]
    fn broken_copy_program_stays_fatal() {
        let result = select_copier(CopierKind::Gpu, || {
            Err(SetupError::ShaderCompile {
                stage: "fragment",
                message: "unknown identifier".into(),
            })
        });
        assert!(matches!(result, Err(SetupError::ShaderCompile { .. })));

        let result = select_copier(CopierKind::Gpu, || {
            Err(SetupError::PipelineLink("bad layout".into()))
        });
        assert!(matches!(result, Err(SetupError::PipelineLink(_))));
    }

    #[test]
    fn cpu_request_skips_gpu_setup() {
        let result = select_copier(CopierKind::Cpu, || panic!("GPU setup should not run"));
        assert!(result.is_ok());
    }

    #[test]
    fn unorm_quantization_rounds() {
        assert_eq!(confidence_to_unorm(0.0), 0);
        assert_eq!(confidence_to_unorm(1.0), 255);
        assert_eq!(confidence_to_unorm(0.5), 128);
        assert_eq!(confidence_to_unorm(2.0), 255);
    }
}
