use super::{CaptureSource, FramePool, VideoFrame};
use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::Instant;

/// Synthetic input: a moving gradient with a bright box standing in for the subject
pub struct TestPatternCapture {
    pool: FramePool,
    started: Instant,
    width: u32,
    height: u32,
    frame_index: u64,
    stopped: bool,
}

impl TestPatternCapture {
    pub fn new(width: u32, height: u32, pool: FramePool) -> Self {
        tracing::info!("Using synthetic test pattern at {}x{}", width, height);
        Self {
            pool,
            started: Instant::now(),
            width,
            height,
            frame_index: 0,
            stopped: false,
        }
    }

    fn render(&self) -> RgbImage {
        let (width, height) = (self.width, self.height);
        let shift = ((self.frame_index * 4) % u64::from(width.max(1))) as u32;
        let box_w = (width / 3).max(1);
        let box_h = (height / 2).max(1);
        let box_x = (width - box_w) / 2;
        let box_y = height - box_h;

        RgbImage::from_fn(width, height, |x, y| {
            let in_box = x >= box_x && x < box_x + box_w && y >= box_y;
            if in_box {
                Rgb([235, 200, 170])
            } else {
                let r = (((x + shift) % width) * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                Rgb([r, g, 128])
            }
        })
    }
}

impl CaptureSource for TestPatternCapture {
    fn capture_frame(&mut self) -> Result<VideoFrame> {
        anyhow::ensure!(!self.stopped, "test pattern source has been stopped");
        let image = self.render();
        self.frame_index += 1;
        Ok(self.pool.acquire(image, self.started.elapsed())?)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}
