use super::filter::{Filter, FilterCache};
use image::{imageops, Rgba, RgbaImage};

/// Porter-Duff operator used when drawing onto the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositeOp {
    #[default]
    SourceOver,
    /// Source kept only where the surface is opaque, surface discarded
    SourceIn,
    /// Surface kept on top, source shows through where the surface is transparent
    DestinationAtop,
}

impl CompositeOp {
    /// Whether pixels outside the drawn rectangle are affected
    fn affects_whole_surface(self) -> bool {
        !matches!(self, CompositeOp::SourceOver)
    }

    /// Blend premultiplied source over destination, returning premultiplied color and alpha
    fn blend(self, src: [f32; 3], sa: f32, dst: [f32; 3], da: f32) -> ([f32; 3], f32) {
        let mut out = [0.0; 3];
        let alpha = match self {
            CompositeOp::SourceOver => {
                for c in 0..3 {
                    out[c] = src[c] + dst[c] * (1.0 - sa);
                }
                sa + da * (1.0 - sa)
            }
            CompositeOp::SourceIn => {
                for c in 0..3 {
                    out[c] = src[c] * da;
                }
                sa * da
            }
            CompositeOp::DestinationAtop => {
                for c in 0..3 {
                    out[c] = src[c] * (1.0 - da) + dst[c] * sa;
                }
                sa
            }
        };
        (out, alpha)
    }
}

/// Drawing state captured by `save` and brought back by `restore`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DrawState {
    pub composite_op: CompositeOp,
    pub filter: Filter,
}

/// 2D drawing target with canvas-style compositing state
///
/// Pixels are stored as straight (non-premultiplied) RGBA; blending happens
/// on premultiplied values.
#[derive(Debug)]
pub struct Surface {
    pixels: RgbaImage,
    state: DrawState,
    saved: Vec<DrawState>,
    filters: FilterCache,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbaImage::new(width, height),
            state: DrawState::default(),
            saved: Vec::new(),
            filters: FilterCache::default(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Change the backing size; contents are cleared when the size changes
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.pixels.dimensions() != (width, height) {
            tracing::debug!("Resizing output surface to {}x{}", width, height);
            self.pixels = RgbaImage::new(width, height);
        }
    }

    pub fn state(&self) -> DrawState {
        self.state
    }

    pub fn set_composite_op(&mut self, op: CompositeOp) {
        self.state.composite_op = op;
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.state.filter = filter;
    }

    pub fn save(&mut self) {
        self.saved.push(self.state);
    }

    /// Pop the last saved state. Unbalanced restores are ignored.
    pub fn restore(&mut self) {
        if let Some(state) = self.saved.pop() {
            self.state = state;
        }
    }

    /// Set a rectangle to transparent black
    pub fn clear_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let (surface_w, surface_h) = self.pixels.dimensions();
        let x_end = x.saturating_add(width).min(surface_w);
        let y_end = y.saturating_add(height).min(surface_h);
        for py in y..y_end {
            for px in x..x_end {
                self.pixels.put_pixel(px, py, Rgba([0, 0, 0, 0]));
            }
        }
    }

    /// Draw `image` stretched into the destination rectangle using the current state
    pub fn draw_image(&mut self, image: &RgbaImage, x: u32, y: u32, width: u32, height: u32) {
        if width == 0 || height == 0 || image.width() == 0 || image.height() == 0 {
            return;
        }

        let stretched;
        let source = if image.dimensions() != (width, height) {
            stretched = imageops::resize(image, width, height, imageops::FilterType::Triangle);
            &stretched
        } else {
            image
        };
        let filtered;
        let source = match self.state.filter {
            Filter::None => source,
            filter => {
                filtered = self.filters.apply(source, filter);
                &filtered
            }
        };

        let op = self.state.composite_op;
        let (surface_w, surface_h) = self.pixels.dimensions();
        let inside = |px: u32, py: u32| {
            px >= x && py >= y && px - x < width && py - y < height
        };

        for py in 0..surface_h {
            for px in 0..surface_w {
                let src = if inside(px, py) {
                    *source.get_pixel(px - x, py - y)
                } else if op.affects_whole_surface() {
                    Rgba([0, 0, 0, 0])
                } else {
                    continue;
                };
                let dst = self.pixels.get_pixel_mut(px, py);
                *dst = composite_pixel(op, src, *dst);
            }
        }
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Immutable copy of the current contents
    pub fn snapshot(&self) -> RgbaImage {
        self.pixels.clone()
    }
}

fn composite_pixel(op: CompositeOp, src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = src[3] as f32 / 255.0;
    let da = dst[3] as f32 / 255.0;
    let premultiply = |p: Rgba<u8>, a: f32| {
        [
            p[0] as f32 / 255.0 * a,
            p[1] as f32 / 255.0 * a,
            p[2] as f32 / 255.0 * a,
        ]
    };

    let (color, alpha) = op.blend(premultiply(src, sa), sa, premultiply(dst, da), da);
    if alpha <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba([
        to_u8(color[0] / alpha),
        to_u8(color[1] / alpha),
        to_u8(color[2] / alpha),
        to_u8(alpha),
    ])
}
