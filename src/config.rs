use crate::error::ConfigError;
use std::time::Duration;

pub const FRAME_RATE: u32 = 30;
pub const BLUR_RADIUS: f32 = 10.0;
pub const MAX_FRAME_RATE: u32 = 240;
/// Largest blur radius in pixels; each blur pass costs O(radius) per line
pub const MAX_BLUR_RADIUS: f32 = 100.0;

/// What the compositor writes to the output surface each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// Sharp subject over a blurred copy of the frame
    #[default]
    Blur,
    /// Grayscale mask only, for checking segmentation quality
    Matte,
}

/// Runtime settings shared by the frame loop, pipeline and compositor
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub frame_rate: u32,
    pub blur_radius: f32,
    /// How long a tick waits for its cycle before giving up on it
    pub cycle_timeout: Duration,
    /// Maximum number of captured frames alive at once
    pub frame_pool_capacity: usize,
    pub render_mode: RenderMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: FRAME_RATE,
            blur_radius: BLUR_RADIUS,
            cycle_timeout: Duration::from_millis(500),
            frame_pool_capacity: 2,
            render_mode: RenderMode::Blur,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::FrameRate {
                value: self.frame_rate,
                max: MAX_FRAME_RATE,
            });
        }
        if !(0.0..=MAX_BLUR_RADIUS).contains(&self.blur_radius) {
            return Err(ConfigError::BlurRadius {
                value: self.blur_radius,
                max: MAX_BLUR_RADIUS,
            });
        }
        if self.cycle_timeout.is_zero() {
            return Err(ConfigError::CycleTimeout);
        }
        if self.frame_pool_capacity == 0 {
            return Err(ConfigError::FramePool);
        }
        Ok(())
    }

    /// Interval between ticks (1000 / fps milliseconds)
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.blur_radius, 10.0);
    }

    #[test]
    fn tick_period_follows_frame_rate() {
        let config = PipelineConfig::default();
        let period = config.tick_period().as_secs_f64() * 1000.0;
        assert!((period - 33.333).abs() < 0.01);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = PipelineConfig {
            frame_rate: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::FrameRate { .. })));

        config.frame_rate = 30;
        config.blur_radius = f32::NAN;
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "blur radius must be between 0 and 100 px, got NaN"
        );

        config.blur_radius = 1e30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlurRadius { max, .. }) if max == MAX_BLUR_RADIUS
        ));
        config.blur_radius = MAX_BLUR_RADIUS;
        assert!(config.validate().is_ok());

        config.blur_radius = 4.0;
        config.cycle_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::CycleTimeout));

        config.cycle_timeout = Duration::from_millis(100);
        config.frame_pool_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::FramePool));
    }
}
