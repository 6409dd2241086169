use crate::capture::{CaptureSource, VideoFrame};
use crate::compositor::Compositor;
use crate::mask::MaskCopier;
use crate::segmentation::ModelSession;
use anyhow::Result;
use image::RgbaImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time spent in each stage of a rendered cycle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleTimings {
    pub capture: Duration,
    pub segment: Duration,
    pub copy: Duration,
    pub composite: Duration,
}

impl CycleTimings {
    pub fn total(&self) -> Duration {
        self.capture + self.segment + self.copy + self.composite
    }
}

/// Why a cycle produced no new output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("model produced no mask")]
    NoMask,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("processing failed: {0}")]
    Processing(String),
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Rendered {
        image: Arc<RgbaImage>,
        timings: CycleTimings,
    },
    Skipped(SkipReason),
}

/// Everything one frame passes through, from capture to the output surface
pub struct Pipeline {
    capture: Box<dyn CaptureSource>,
    session: ModelSession,
    copier: Box<dyn MaskCopier>,
    compositor: Compositor,
}

impl Pipeline {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        session: ModelSession,
        copier: Box<dyn MaskCopier>,
        compositor: Compositor,
    ) -> Self {
        Self {
            capture,
            session,
            copier,
            compositor,
        }
    }

    /// Capture, segment and composite one frame
    ///
    /// The captured frame is always released before returning. Failures skip
    /// the cycle and leave the previous output untouched.
    pub fn run_cycle(&mut self, timestamp_ms: f64) -> CycleOutcome {
        let capture_start = Instant::now();
        let mut frame = match self.capture.capture_frame() {
            Ok(frame) => frame,
            Err(err) => return CycleOutcome::Skipped(SkipReason::Capture(format!("{err:#}"))),
        };
        let capture_time = capture_start.elapsed();

        let outcome = self.process(&frame, timestamp_ms);
        frame.close();

        match outcome {
            Ok(Some((image, mut timings))) => {
                timings.capture = capture_time;
                CycleOutcome::Rendered {
                    image: Arc::new(image),
                    timings,
                }
            }
            Ok(None) => CycleOutcome::Skipped(SkipReason::NoMask),
            Err(err) => CycleOutcome::Skipped(SkipReason::Processing(format!("{err:#}"))),
        }
    }

    fn process(
        &mut self,
        frame: &VideoFrame,
        timestamp_ms: f64,
    ) -> Result<Option<(RgbaImage, CycleTimings)>> {
        let mut timings = CycleTimings::default();

        let segment_start = Instant::now();
        let Some(mask) = self.session.segment(frame.image()?, timestamp_ms)? else {
            return Ok(None);
        };
        timings.segment = segment_start.elapsed();

        let copy_start = Instant::now();
        let mask_image = self.copier.copy(&mask)?;
        timings.copy = copy_start.elapsed();

        let composite_start = Instant::now();
        self.compositor.composite(&mask_image, frame)?;
        timings.composite = composite_start.elapsed();

        Ok(Some((self.compositor.surface().snapshot(), timings)))
    }

    /// Detach the capture device and drop the model's temporal state
    pub fn shutdown(&mut self) {
        if let Err(err) = self.capture.stop() {
            tracing::warn!("Failed to stop capture cleanly: {:#}", err);
        }
        self.session.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FramePool, TestPatternCapture};
    use crate::config::RenderMode;
    use crate::mask::CpuMaskCopier;
    use crate::segmentation::{ConfidenceMask, SegmentationModel};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoMaskModel;

    impl SegmentationModel for NoMaskModel {
        fn segment(&mut self, _frame: &RgbImage, _ts: f64) -> Result<Option<ConfidenceMask>> {
            Ok(None)
        }
    }

    fn pipeline(pool: &FramePool, session: ModelSession) -> Pipeline {
        Pipeline::new(
            Box::new(TestPatternCapture::new(32, 18, pool.clone())),
            session,
            Box::new(CpuMaskCopier),
            Compositor::new(10.0, RenderMode::Blur),
        )
    }

    #[test]
    fn rendered_cycle_matches_frame_size_and_releases_frame() {
        let pool = FramePool::new(1);
        let mut pipeline = pipeline(&pool, ModelSession::passthrough());

        for ts in [1.0, 2.0, 3.0] {
            match pipeline.run_cycle(ts) {
                CycleOutcome::Rendered { image, .. } => assert_eq!(image.dimensions(), (32, 18)),
                CycleOutcome::Skipped(reason) => panic!("cycle skipped: {reason}"),
            }
            assert_eq!(pool.outstanding(), 0);
        }
    }

    #[test]
    fn missing_mask_skips_and_still_releases_frame() {
        let pool = FramePool::new(1);
        let mut pipeline = pipeline(&pool, ModelSession::from_model(Box::new(NoMaskModel)));

        assert!(matches!(
            pipeline.run_cycle(1.0),
            CycleOutcome::Skipped(SkipReason::NoMask)
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn processing_errors_skip_the_cycle() {
        let pool = FramePool::new(1);
        let mut pipeline = pipeline(&pool, ModelSession::passthrough());

        assert!(matches!(pipeline.run_cycle(5.0), CycleOutcome::Rendered { .. }));
        // Repeating a timestamp is rejected by the session
        match pipeline.run_cycle(5.0) {
            CycleOutcome::Skipped(SkipReason::Processing(msg)) => {
                assert!(msg.contains("timestamps must increase"), "{msg}")
            }
            other => panic!("expected a processing skip, got {other:?}"),
        }
        assert_eq!(pool.outstanding(), 0);
    }

    struct RecurrentModel {
        resets: Arc<AtomicUsize>,
    }

    impl SegmentationModel for RecurrentModel {
        fn segment(&mut self, frame: &RgbImage, _ts: f64) -> Result<Option<ConfidenceMask>> {
            let (w, h) = frame.dimensions();
            Ok(Some(ConfidenceMask::uniform(w, h, 1.0)?))
        }

        fn reset_state(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn shutdown_resets_model_state() {
        let pool = FramePool::new(1);
        let resets = Arc::new(AtomicUsize::new(0));
        let model = RecurrentModel {
            resets: Arc::clone(&resets),
        };
        let mut pipeline = pipeline(&pool, ModelSession::from_model(Box::new(model)));

        assert!(matches!(pipeline.run_cycle(1.0), CycleOutcome::Rendered { .. }));
        pipeline.shutdown();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_capture_skips_with_capture_reason() {
        let pool = FramePool::new(1);
        let mut pipeline = pipeline(&pool, ModelSession::passthrough());
        pipeline.shutdown();
        assert!(matches!(
            pipeline.run_cycle(1.0),
            CycleOutcome::Skipped(SkipReason::Capture(_))
        ));
    }
}
