use crate::error::FrameError;
use image::{buffer::ConvertBuffer, RgbImage, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Bounded budget of frames that may be alive at the same time
///
/// Capture sources acquire a lease per frame. A pipeline that keeps frames
/// around instead of closing them runs the pool dry and gets
/// `FrameError::PoolExhausted` rather than growing without limit.
#[derive(Debug, Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    outstanding: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Wrap captured pixels in a frame, taking one slot from the pool
    pub fn acquire(&self, image: RgbImage, timestamp: Duration) -> Result<VideoFrame, FrameError> {
        let capacity = self.inner.capacity;
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < capacity).then_some(held + 1)
            })
            .map_err(|_| FrameError::PoolExhausted { capacity })?;

        let (width, height) = image.dimensions();
        Ok(VideoFrame {
            image: Some(image),
            width,
            height,
            timestamp,
            lease: Some(FrameLease {
                pool: Arc::clone(&self.inner),
            }),
        })
    }

    /// Number of frames currently held
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct FrameLease {
    pool: Arc<PoolInner>,
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A captured video frame
///
/// Pixels stay readable until `close()` is called; afterwards every access
/// fails with `FrameError::Released`. Dropping an open frame also returns its
/// slot to the pool.
#[derive(Debug)]
pub struct VideoFrame {
    image: Option<RgbImage>,
    width: u32,
    height: u32,
    timestamp: Duration,
    lease: Option<FrameLease>,
}

impl VideoFrame {
    pub fn image(&self) -> Result<&RgbImage, FrameError> {
        self.image.as_ref().ok_or(FrameError::Released)
    }

    pub fn to_rgba(&self) -> Result<RgbaImage, FrameError> {
        Ok(self.image()?.convert())
    }

    /// Reported display dimensions, still readable after release
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Presentation timestamp relative to the start of capture
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn is_closed(&self) -> bool {
        self.image.is_none()
    }

    /// Release the pixels and the pool slot. Safe to call more than once.
    pub fn close(&mut self) {
        self.image = None;
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixels(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]))
    }

    #[test]
    fn released_frame_cannot_be_drawn() {
        let pool = FramePool::new(1);
        let mut frame = pool.acquire(pixels(4, 2), Duration::ZERO).unwrap();
        assert!(frame.image().is_ok());

        frame.close();
        assert!(frame.is_closed());
        assert_eq!(frame.image().unwrap_err(), FrameError::Released);
        assert_eq!(frame.to_rgba().unwrap_err(), FrameError::Released);
        assert_eq!(frame.dimensions(), (4, 2));

        frame.close();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn pool_refuses_frames_beyond_capacity() {
        let pool = FramePool::new(2);
        let mut first = pool.acquire(pixels(2, 2), Duration::ZERO).unwrap();
        let _second = pool.acquire(pixels(2, 2), Duration::ZERO).unwrap();

        let err = pool.acquire(pixels(2, 2), Duration::ZERO).unwrap_err();
        assert_eq!(err, FrameError::PoolExhausted { capacity: 2 });

        first.close();
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.acquire(pixels(2, 2), Duration::ZERO).is_ok());
    }

    #[test]
    fn dropping_a_frame_returns_its_slot() {
        let pool = FramePool::new(1);
        {
            let _frame = pool.acquire(pixels(1, 1), Duration::from_millis(5)).unwrap();
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn rgba_conversion_is_opaque() {
        let pool = FramePool::new(1);
        let frame = pool.acquire(pixels(3, 3), Duration::ZERO).unwrap();
        let rgba = frame.to_rgba().unwrap();
        assert_eq!(rgba.get_pixel(1, 1).0, [10, 20, 30, 255]);
    }
}
