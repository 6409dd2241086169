use thiserror::Error;

/// Violations of the video frame lifetime contract
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("video frame has already been released")]
    Released,

    #[error("frame pool exhausted: {capacity} frames still held, release frames after use")]
    PoolExhausted { capacity: usize },
}

/// Failures while setting up the GPU mask copier
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no GPU adapter available")]
    NoAdapter,

    #[error("failed to acquire GPU device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("{stage} shader failed to compile: {message}")]
    ShaderCompile { stage: &'static str, message: String },

    #[error("render pipeline failed to link: {0}")]
    PipelineLink(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("mask buffer holds {actual} values, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("mask has zero width or height")]
    EmptyMask,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("timestamps must increase in video mode: got {current_ms:.3}ms after {previous_ms:.3}ms")]
    NonMonotonicTimestamp { previous_ms: f64, current_ms: f64 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("frame rate must be between 1 and {max}, got {value}")]
    FrameRate { value: u32, max: u32 },

    #[error("blur radius must be between 0 and {max} px, got {value}")]
    BlurRadius { value: f32, max: f32 },

    #[error("cycle timeout must be greater than zero")]
    CycleTimeout,

    #[error("frame pool needs room for at least one frame")]
    FramePool,
}
