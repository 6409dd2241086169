use super::OutputSink;
use anyhow::{Context, Result};
use image::RgbaImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        // Announce the frame format so readers of the loopback device can negotiate
        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let negotiated = Output::set_format(&device, &requested)
            .context("Failed to set YUYV output format")?;
        anyhow::ensure!(
            negotiated.width == width && negotiated.height == height,
            "v4l2loopback device accepted {}x{} instead of {}x{}",
            negotiated.width,
            negotiated.height,
            width,
            height
        );
        drop(device);

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width,
            height,
        })
    }

    /// Convert a frame to YUV422 (YUYV), flattening transparency over black
    fn rgba_to_yuyv(frame: &RgbaImage) -> Vec<u8> {
        let (width, height) = frame.dimensions();
        let mut yuyv = Vec::with_capacity((width.div_ceil(2) * 4 * height) as usize);

        let flatten = |x: u32, y: u32| {
            let p = frame.get_pixel(x, y);
            let a = p[3] as u16;
            let over_black = |c: u8| ((c as u16 * a + 127) / 255) as u8;
            (over_black(p[0]), over_black(p[1]), over_black(p[2]))
        };

        for y in 0..height {
            for x in (0..width).step_by(2) {
                let pixel1 = flatten(x, y);
                let pixel2 = if x + 1 < width { flatten(x + 1, y) } else { pixel1 };

                let (y1, u1, v1) = rgb_to_yuv(pixel1.0, pixel1.1, pixel1.2);
                let (y2, u2, v2) = rgb_to_yuv(pixel2.0, pixel2.1, pixel2.2);

                // Average U and V for the pair of pixels
                let u = ((u1 as u16 + u2 as u16) / 2) as u8;
                let v = ((v1 as u16 + v2 as u16) / 2) as u8;

                // YUYV format: Y0 U Y1 V
                yuyv.extend_from_slice(&[y1, u, y2, v]);
            }
        }

        yuyv
    }
}

/// Convert RGB to YUV color space
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let resized;
        let frame = if frame.dimensions() != (self.width, self.height) {
            resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Lanczos3,
            );
            &resized
        } else {
            frame
        };

        let yuyv_data = Self::rgba_to_yuyv(frame);

        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
