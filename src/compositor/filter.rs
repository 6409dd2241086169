use crate::config::MAX_BLUR_RADIUS;
use image::RgbaImage;
use std::collections::HashMap;

/// Filter applied to images as they are drawn
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Filter {
    #[default]
    None,
    /// Gaussian blur with the given standard deviation in pixels, capped at
    /// `MAX_BLUR_RADIUS`. Edges are clamped, so unlike canvas `blur()` the
    /// border does not fade towards transparent.
    Blur { radius: f32 },
}

const BOX_PASSES: usize = 3;

/// Box widths whose three successive passes approximate a gaussian
fn box_sizes(sigma: f32) -> [usize; BOX_PASSES] {
    let sigma = sigma.clamp(0.0, MAX_BLUR_RADIUS);
    let n = BOX_PASSES as f32;
    let ideal = (12.0 * sigma * sigma / n + 1.0).sqrt();
    let mut lower = (ideal.floor() as usize).max(1);
    if lower % 2 == 0 {
        lower -= 1;
    }
    let upper = lower + 2;

    let lf = lower as f32;
    let m = ((12.0 * sigma * sigma - n * lf * lf - 4.0 * n * lf - 3.0 * n) / (-4.0 * lf - 4.0))
        .round()
        .max(0.0) as usize;

    let mut sizes = [upper; BOX_PASSES];
    for size in sizes.iter_mut().take(m) {
        *size = lower;
    }
    sizes
}

/// Applies filters, remembering box sizes per radius
#[derive(Debug, Default)]
pub struct FilterCache {
    box_sizes: HashMap<u32, [usize; BOX_PASSES]>,
}

impl FilterCache {
    pub fn apply(&mut self, image: &RgbaImage, filter: Filter) -> RgbaImage {
        match filter {
            Filter::None => image.clone(),
            Filter::Blur { radius } if radius <= 0.0 || !radius.is_finite() => image.clone(),
            Filter::Blur { radius } => {
                let sizes = *self
                    .box_sizes
                    .entry(radius.to_bits())
                    .or_insert_with(|| box_sizes(radius));
                blur(image, sizes)
            }
        }
    }
}

/// Edge-clamped blur over premultiplied channels in 0..=255 units
fn blur(image: &RgbaImage, sizes: [usize; BOX_PASSES]) -> RgbaImage {
    let _span = tracing::debug_span!("blur").entered();
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }

    let mut buffer: Vec<[f32; 4]> = image
        .pixels()
        .map(|p| {
            let a = p[3] as f32 / 255.0;
            [p[0] as f32 * a, p[1] as f32 * a, p[2] as f32 * a, p[3] as f32]
        })
        .collect();
    let mut scratch = vec![[0.0f32; 4]; buffer.len()];

    for size in sizes {
        let radius = (size - 1) / 2;
        if radius == 0 {
            continue;
        }
        box_pass(&buffer, &mut scratch, w, h, radius, 1, w);
        box_pass(&scratch, &mut buffer, h, w, radius, w, 1);
    }

    let mut out = RgbaImage::new(width, height);
    for (pixel, value) in out.pixels_mut().zip(&buffer) {
        let alpha = value[3].clamp(0.0, 255.0);
        if alpha <= 0.0 {
            pixel.0 = [0, 0, 0, 0];
            continue;
        }
        let scale = 255.0 / alpha;
        let channel = |c: f32| (c * scale).round().clamp(0.0, 255.0) as u8;
        pixel.0 = [
            channel(value[0]),
            channel(value[1]),
            channel(value[2]),
            alpha.round() as u8,
        ];
    }
    out
}

/// One sliding-window box pass along lines of `len` samples spaced `step` apart
///
/// `lines` lines start `line_step` apart. Horizontal passes use step 1,
/// vertical passes step by the row width.
fn box_pass(
    src: &[[f32; 4]],
    dst: &mut [[f32; 4]],
    len: usize,
    lines: usize,
    radius: usize,
    step: usize,
    line_step: usize,
) {
    let window = (2 * radius + 1) as f32;
    let last = len - 1;

    for line in 0..lines {
        let base = line * line_step;
        let at = |i: usize| src[base + i.min(last) * step];

        let mut acc = [0.0f32; 4];
        for offset in 0..=2 * radius {
            // Window centred on index 0 reaches `radius` samples to the left, all clamped to 0
            let sample = at(offset.saturating_sub(radius));
            for c in 0..4 {
                acc[c] += sample[c];
            }
        }

        for i in 0..len {
            let target = &mut dst[base + i * step];
            for c in 0..4 {
                target[c] = acc[c] / window;
            }
            let incoming = at(i + radius + 1);
            let outgoing = at(i.saturating_sub(radius));
            for c in 0..4 {
                acc[c] += incoming[c] - outgoing[c];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn box_sizes_approximate_sigma_ten() {
        assert_eq!(box_sizes(10.0), [19, 19, 21]);
        assert!(box_sizes(0.5).iter().all(|&s| s == 1 || s == 3));
    }

    #[test]
    fn huge_radius_is_capped() {
        assert_eq!(box_sizes(1e30), box_sizes(MAX_BLUR_RADIUS));
        assert_eq!(box_sizes(f32::MAX), box_sizes(MAX_BLUR_RADIUS));

        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let blurred = FilterCache::default().apply(&image, Filter::Blur { radius: 1e30 });
        assert_eq!(blurred, image);
    }

    #[test]
    fn flat_image_is_unchanged() {
        let image = RgbaImage::from_pixel(23, 17, Rgba([90, 140, 200, 255]));
        let blurred = FilterCache::default().apply(&image, Filter::Blur { radius: 10.0 });
        assert_eq!(blurred, image);
    }

    #[test]
    fn zero_radius_is_identity() {
        let mut image = RgbaImage::new(5, 5);
        image.put_pixel(2, 2, Rgba([255, 255, 255, 255]));
        let cache = &mut FilterCache::default();
        assert_eq!(cache.apply(&image, Filter::Blur { radius: 0.0 }), image);
        assert_eq!(cache.apply(&image, Filter::None), image);
    }

    #[test]
    fn blur_spreads_a_hard_edge() {
        let image = RgbaImage::from_fn(40, 4, |x, _| {
            if x < 20 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let blurred = FilterCache::default().apply(&image, Filter::Blur { radius: 3.0 });

        let left = blurred.get_pixel(18, 1)[0];
        let right = blurred.get_pixel(21, 1)[0];
        assert!(left > 0 && left < 128, "left of edge: {left}");
        assert!(right > 128 && right < 255, "right of edge: {right}");
        assert_eq!(blurred.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(blurred.get_pixel(39, 3).0, [255, 255, 255, 255]);
        assert!(blurred.pixels().all(|p| p[3] == 255));
    }
}
