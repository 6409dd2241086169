//! Background blur compositing.
//!
//! Each cycle replays a fixed Porter-Duff recipe on the output surface:
//! the mask bitmap seeds alpha, `SourceIn` cuts the sharp subject out of the
//! frame, and `DestinationAtop` slides a blurred copy of the same frame
//! underneath it. The order of the draws matters.

mod filter;
mod surface;

pub use filter::Filter;
pub use surface::{CompositeOp, Surface};

use crate::capture::VideoFrame;
use crate::config::RenderMode;
use crate::error::FrameError;
use image::{Rgba, RgbaImage};

pub struct Compositor {
    surface: Surface,
    blur_radius: f32,
    mode: RenderMode,
}

impl Compositor {
    pub fn new(blur_radius: f32, mode: RenderMode) -> Self {
        Self {
            surface: Surface::new(0, 0),
            blur_radius,
            mode,
        }
    }

    /// Composite `frame` using `mask` as the subject stencil
    ///
    /// The surface is sized to the frame's reported dimensions every call,
    /// and the mask is stretched to match whatever its own size.
    pub fn composite(&mut self, mask: &RgbaImage, frame: &VideoFrame) -> Result<(), FrameError> {
        let _span = tracing::debug_span!("composite").entered();

        let original = frame.to_rgba()?;
        let (width, height) = frame.dimensions();
        self.surface.resize(width, height);

        if self.mode == RenderMode::Matte {
            self.draw_matte(mask, width, height);
            return Ok(());
        }

        let surface = &mut self.surface;
        surface.save();
        surface.clear_rect(0, 0, width, height);

        surface.draw_image(mask, 0, 0, width, height);

        surface.set_composite_op(CompositeOp::SourceIn);
        surface.draw_image(&original, 0, 0, width, height);

        surface.set_filter(Filter::Blur {
            radius: self.blur_radius,
        });
        surface.set_composite_op(CompositeOp::DestinationAtop);
        surface.draw_image(&original, 0, 0, width, height);

        surface.restore();
        Ok(())
    }

    /// Opaque grayscale view of the mask
    fn draw_matte(&mut self, mask: &RgbaImage, width: u32, height: u32) {
        let mut opaque = mask.clone();
        for pixel in opaque.pixels_mut() {
            let v = pixel[3];
            *pixel = Rgba([v, v, v, 255]);
        }
        self.surface.clear_rect(0, 0, width, height);
        self.surface.draw_image(&opaque, 0, 0, width, height);
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::filter::FilterCache;
    use super::surface::DrawState;
    use super::*;
    use crate::capture::FramePool;
    use crate::mask::{CpuMaskCopier, MaskCopier};
    use crate::segmentation::ConfidenceMask;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn test_frame(pool: &FramePool, width: u32, height: u32) -> VideoFrame {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 37 % 256) as u8, (y * 53 % 256) as u8, ((x + y) * 11 % 256) as u8])
        });
        pool.acquire(image, Duration::ZERO).unwrap()
    }

    fn mask_bitmap(width: u32, height: u32, value: f32) -> RgbaImage {
        let mask = ConfidenceMask::uniform(width, height, value).unwrap();
        CpuMaskCopier.copy(&mask).unwrap()
    }

    fn max_channel_diff(a: &RgbaImage, b: &RgbaImage) -> u8 {
        a.pixels()
            .zip(b.pixels())
            .flat_map(|(p, q)| p.0.into_iter().zip(q.0).map(|(x, y)| x.abs_diff(y)))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn output_matches_frame_dimensions() {
        let pool = FramePool::new(2);
        let mut compositor = Compositor::new(10.0, RenderMode::Blur);

        for (width, height) in [(32, 24), (17, 9)] {
            let frame = test_frame(&pool, width, height);
            // Mask at a different resolution gets stretched
            compositor
                .composite(&mask_bitmap(8, 8, 0.5), &frame)
                .unwrap();
            assert_eq!(compositor.surface().dimensions(), (width, height));
        }
    }

    #[test]
    fn full_confidence_yields_the_sharp_frame() {
        let pool = FramePool::new(1);
        let frame = test_frame(&pool, 40, 30);
        let mut compositor = Compositor::new(10.0, RenderMode::Blur);

        compositor.composite(&mask_bitmap(40, 30, 1.0), &frame).unwrap();

        let original = frame.to_rgba().unwrap();
        assert_eq!(compositor.surface().pixels(), &original);
    }

    #[test]
    fn zero_confidence_yields_the_blurred_frame() {
        let pool = FramePool::new(1);
        let frame = test_frame(&pool, 40, 30);
        let mut compositor = Compositor::new(10.0, RenderMode::Blur);

        compositor.composite(&mask_bitmap(40, 30, 0.0), &frame).unwrap();

        let blurred =
            FilterCache::default().apply(&frame.to_rgba().unwrap(), Filter::Blur { radius: 10.0 });
        assert!(max_channel_diff(compositor.surface().pixels(), &blurred) <= 1);
    }

    #[test]
    fn subject_stays_sharp_over_blurred_background() {
        let pool = FramePool::new(1);
        let frame = test_frame(&pool, 20, 10);
        let values: Vec<f32> = (0..200).map(|i| if i % 20 < 10 { 1.0 } else { 0.0 }).collect();
        let mask = CpuMaskCopier
            .copy(&ConfidenceMask::new(20, 10, values).unwrap())
            .unwrap();

        let mut compositor = Compositor::new(4.0, RenderMode::Blur);
        compositor.composite(&mask, &frame).unwrap();

        let original = frame.to_rgba().unwrap();
        let blurred =
            FilterCache::default().apply(&original, Filter::Blur { radius: 4.0 });
        let out = compositor.surface().pixels();
        assert_eq!(out.get_pixel(3, 5), original.get_pixel(3, 5));
        assert_eq!(out.get_pixel(15, 5), blurred.get_pixel(15, 5));
        assert!(out.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn state_is_restored_after_composite() {
        let pool = FramePool::new(1);
        let frame = test_frame(&pool, 8, 8);
        let mut compositor = Compositor::new(10.0, RenderMode::Blur);
        compositor.composite(&mask_bitmap(8, 8, 0.3), &frame).unwrap();
        assert_eq!(compositor.surface().state(), DrawState::default());
    }

    #[test]
    fn released_frame_is_rejected() {
        let pool = FramePool::new(1);
        let mut frame = test_frame(&pool, 8, 8);
        frame.close();

        let mut compositor = Compositor::new(10.0, RenderMode::Blur);
        let err = compositor.composite(&mask_bitmap(8, 8, 1.0), &frame).unwrap_err();
        assert_eq!(err, FrameError::Released);
    }

    #[test]
    fn matte_mode_shows_mask_as_gray() {
        let pool = FramePool::new(1);
        let frame = test_frame(&pool, 6, 6);
        let mut compositor = Compositor::new(10.0, RenderMode::Matte);
        compositor.composite(&mask_bitmap(6, 6, 1.0), &frame).unwrap();
        assert!(compositor
            .surface()
            .pixels()
            .pixels()
            .all(|p| p.0 == [255, 255, 255, 255]));
    }
}
