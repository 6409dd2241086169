mod capture;
mod compositor;
mod config;
mod error;
mod frame_loop;
mod mask;
mod output;
mod pipeline;
mod segmentation;

use anyhow::{Context, Result};
use capture::{CaptureSource, FramePool, TestPatternCapture, WebcamCapture};
use clap::Parser;
use compositor::Compositor;
use config::{PipelineConfig, RenderMode};
use frame_loop::FrameLoop;
use mask::{CopierKind, GpuMaskCopier};
use output::{OutputSink, OutputStream, V4L2Output};
use pipeline::Pipeline;
use segmentation::{ExecutionPreference, ModelKind, ModelSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = config::FRAME_RATE)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    /// If not provided, runs in passthrough mode without segmentation
    #[arg(long)]
    model: Option<PathBuf>,

    /// Model family of the ONNX file
    #[arg(long, value_enum, default_value_t = ModelKind::Selfie)]
    model_kind: ModelKind,

    /// Where to run inference
    #[arg(long, value_enum, default_value_t = ExecutionPreference::Gpu)]
    execution: ExecutionPreference,

    /// Mask copy implementation
    #[arg(long, value_enum, default_value_t = CopierKind::Gpu)]
    copier: CopierKind,

    /// Background blur radius in pixels
    #[arg(long, default_value_t = config::BLUR_RADIUS)]
    blur_radius: f32,

    /// Give up on a cycle after this many milliseconds
    #[arg(long, default_value_t = 500)]
    cycle_timeout_ms: u64,

    /// Maximum number of captured frames alive at once
    #[arg(long, default_value_t = 2)]
    frame_pool: usize,

    /// Show matte visualization (grayscale silhouette) instead of the blurred video
    #[arg(long)]
    show_matte: bool,

    /// Use a synthetic moving pattern instead of the webcam
    #[arg(long)]
    test_pattern: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            frame_rate: self.fps,
            blur_radius: self.blur_radius,
            cycle_timeout: Duration::from_millis(self.cycle_timeout_ms),
            frame_pool_capacity: self.frame_pool,
            render_mode: if self.show_matte {
                RenderMode::Matte
            } else {
                RenderMode::Blur
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.pipeline_config();
    config.validate().context("Invalid configuration")?;

    tracing::info!("blurcam starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}, blur radius: {}px", config.frame_rate, config.blur_radius);

    let output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    let pool_capacity = config.frame_pool_capacity;
    let blur_radius = config.blur_radius;
    let render_mode = config.render_mode;
    let factory = move || build_pipeline(&args, pool_capacity, blur_radius, render_mode);

    let (handle, stream) = match FrameLoop::start(factory, config).await {
        Ok(started) => started,
        Err(err) => {
            tracing::error!("Pipeline failed to start: {:#}", err);
            return Err(err.context("Failed to start pipeline"));
        }
    };

    let mut pump = tokio::spawn(pump_output(stream, output));
    tracing::info!("Press Ctrl+C to stop");

    let pump_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            tracing::info!("Ctrl+C received");
            None
        }
        result = &mut pump => Some(result),
    };

    let stats = handle.stop().await?;
    tracing::info!(
        "Rendered {} frames ({} skipped, {} timed out, {} published late, {} captured)",
        stats.rendered,
        stats.skipped,
        stats.timed_out,
        stats.late_rendered,
        stats.captured
    );

    // The stream ends once the loop has stopped, which lets the pump finish
    let pump_result = match pump_result {
        Some(result) => result,
        None => pump.await,
    };
    pump_result.context("Output task failed")?
}

/// Runs on the pipeline worker thread
fn build_pipeline(
    args: &Args,
    pool_capacity: usize,
    blur_radius: f32,
    render_mode: RenderMode,
) -> Result<Pipeline> {
    let pool = FramePool::new(pool_capacity);

    let capture: Box<dyn CaptureSource> = if args.test_pattern {
        tracing::info!("Using synthetic test pattern input");
        Box::new(TestPatternCapture::new(
            args.capture_width,
            args.capture_height,
            pool,
        ))
    } else {
        Box::new(
            WebcamCapture::new(
                args.input_device,
                args.capture_width,
                args.capture_height,
                pool,
            )
            .context("Failed to initialize webcam capture")?,
        )
    };

    let session = if let Some(model_path) = &args.model {
        tracing::info!(
            "Loading {:?} segmentation model from {} ({:?})",
            args.model_kind,
            model_path.display(),
            args.execution
        );
        let session = ModelSession::load(model_path, args.model_kind, args.execution)
            .context("Failed to load segmentation model")?;
        tracing::info!("Segmentation model loaded successfully");
        session
    } else {
        tracing::info!("Running in passthrough mode (no segmentation)");
        ModelSession::passthrough()
    };

    let copier = mask::select_copier(args.copier, GpuMaskCopier::new)
        .context("Failed to set up GPU mask copier (try --copier cpu)")?;

    Ok(Pipeline::new(
        capture,
        session,
        copier,
        Compositor::new(blur_radius, render_mode),
    ))
}

/// Write every captured output frame to the sink until the stream ends
async fn pump_output(mut stream: OutputStream, mut sink: V4L2Output) -> Result<()> {
    tracing::debug!("Writing output at {:?}", sink.resolution());

    while let Some(frame) = stream.next().await {
        let image = Arc::clone(&frame.image);
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = sink.write_frame(&image);
            (sink, result)
        })
        .await
        .context("Output writer panicked")?;
        sink = returned;

        if let Err(err) = result {
            tracing::error!("Failed to write frame {}: {:#}", frame.sequence, err);
            return Err(err);
        }
    }

    tracing::info!("Output stream ended");
    Ok(())
}
