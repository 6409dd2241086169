use super::types::ConfidenceMask;
use anyhow::Result;
use image::{imageops, ImageBuffer, Luma, RgbImage};
use ndarray::Array4;

/// Memory order of the model's image input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [1, 3, height, width]
    Nchw,
    /// [1, height, width, 3]
    Nhwc,
}

/// Preprocessor for converting RGB images to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32, layout: TensorLayout) -> Self {
        Self {
            target_width,
            target_height,
            layout,
        }
    }

    /// Resize to the model input size and normalize to [0, 1] in the model's layout
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let source = if image.dimensions() != (self.target_width, self.target_height) {
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            image
        };

        let (width, height) = (self.target_width as usize, self.target_height as usize);
        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, height, width)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, 3)),
        };

        for (x, y, pixel) in source.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                let value = pixel[channel] as f32 / 255.0;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, channel, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, channel]] = value,
                }
            }
        }

        tensor
    }

    /// Bring a model-resolution mask back to the frame's dimensions
    pub fn resize_mask(
        values: Vec<f32>,
        mask_width: u32,
        mask_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<ConfidenceMask> {
        let _span = tracing::debug_span!("postprocess").entered();

        if (mask_width, mask_height) == (target_width, target_height) {
            return Ok(ConfidenceMask::new(mask_width, mask_height, values)?);
        }

        let source: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(mask_width, mask_height, values).ok_or_else(|| {
                anyhow::anyhow!("mask buffer does not match {mask_width}x{mask_height}")
            })?;

        let resized = imageops::resize(
            &source,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        );

        Ok(ConfidenceMask::new(
            target_width,
            target_height,
            resized.into_raw(),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn nchw_and_nhwc_hold_the_same_values() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([255, 0, 51]));

        let nchw = Preprocessor::new(2, 2, TensorLayout::Nchw).preprocess(&image);
        let nhwc = Preprocessor::new(2, 2, TensorLayout::Nhwc).preprocess(&image);

        assert_eq!(nchw.shape(), &[1, 3, 2, 2]);
        assert_eq!(nhwc.shape(), &[1, 2, 2, 3]);
        assert_eq!(nchw[[0, 0, 0, 1]], 1.0);
        assert_eq!(nhwc[[0, 0, 1, 0]], 1.0);
        assert!((nchw[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
        assert!((nhwc[[0, 0, 1, 2]] - 0.2).abs() < 1e-6);
        assert_eq!(nchw[[0, 0, 1, 1]], 0.0);
    }

    #[test]
    fn preprocess_resizes_to_model_input() {
        let image = RgbImage::from_pixel(40, 30, Rgb([255, 255, 255]));
        let tensor = Preprocessor::new(16, 8, TensorLayout::Nhwc).preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 8, 16, 3]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn resize_mask_targets_frame_dimensions() {
        let mask = Preprocessor::resize_mask(vec![1.0; 4 * 2], 4, 2, 12, 9).unwrap();
        assert_eq!(mask.dimensions(), (12, 9));
        assert!(mask.as_slice().iter().all(|&v| (v - 1.0).abs() < 1e-5));
    }

    #[test]
    fn resize_mask_keeps_matching_masks() {
        let values = vec![0.0, 0.25, 0.5, 1.0];
        let mask = Preprocessor::resize_mask(values.clone(), 2, 2, 2, 2).unwrap();
        assert_eq!(mask.as_slice(), values.as_slice());
    }

    #[test]
    fn resize_mask_rejects_short_buffers() {
        assert!(Preprocessor::resize_mask(vec![0.0; 3], 2, 2, 4, 4).is_err());
    }
}
