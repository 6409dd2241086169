//! Fixed-rate driver for the frame pipeline.
//!
//! The pipeline lives on its own worker thread. Each tick sends one cycle
//! request and waits for its reply (or the cycle timeout) before the next
//! tick is taken, so there is never more than one cycle running and one
//! waiting. The worker publishes every rendered frame to the shared output
//! surface, including cycles whose tick already timed out, and a separate
//! task captures that surface into the `OutputStream` at the same rate.

use crate::config::PipelineConfig;
use crate::output::{OutputFrame, OutputStream};
use crate::pipeline::{CycleOutcome, CycleTimings, Pipeline};
use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Rendered frames between timing reports
const STATS_INTERVAL: u64 = 30;

type SharedSurface = Option<Arc<RgbaImage>>;

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub rendered: u64,
    pub skipped: u64,
    pub timed_out: u64,
    /// Frames published by cycles that finished after their tick timed out
    pub late_rendered: u64,
    /// Surface captures taken for the output stream
    pub captured: u64,
}

struct CycleRequest {
    timestamp_ms: f64,
    reply: oneshot::Sender<CycleOutcome>,
}

/// Cancellation handle for a running loop
///
/// Dropping the handle also stops the loop, but only `stop` waits for the
/// worker to release the capture device.
pub struct LoopHandle {
    shutdown: watch::Sender<bool>,
    loop_task: JoinHandle<LoopStats>,
    capture_task: JoinHandle<u64>,
    worker: std::thread::JoinHandle<u64>,
}

impl LoopHandle {
    /// Stop ticking, wait for the in-flight cycle and shut the pipeline down
    pub async fn stop(self) -> Result<LoopStats> {
        tracing::info!("Stopping frame loop");
        let _ = self.shutdown.send(true);

        let mut stats = self.loop_task.await.context("Frame loop task failed")?;
        stats.captured = self
            .capture_task
            .await
            .context("Surface capture task failed")?;

        let worker = self.worker;
        stats.late_rendered = tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("Failed to join pipeline worker")?
            .map_err(|_| anyhow!("Pipeline worker panicked"))?;

        tracing::info!(
            "Frame loop stopped: {} ticks, {} rendered, {} skipped, {} timed out ({} late)",
            stats.ticks,
            stats.rendered,
            stats.skipped,
            stats.timed_out,
            stats.late_rendered
        );
        Ok(stats)
    }
}

pub struct FrameLoop {
    requests: mpsc::Sender<CycleRequest>,
    shutdown: watch::Receiver<bool>,
    period: Duration,
    cycle_timeout: Duration,
    started: Instant,
    stats: LoopStats,
    totals: CycleTimings,
}

impl FrameLoop {
    /// Build the pipeline on a worker thread and start ticking
    ///
    /// If `factory` fails (no camera, model or GPU setup error) nothing is
    /// started and the error is returned.
    pub async fn start<F>(factory: F, config: PipelineConfig) -> Result<(LoopHandle, OutputStream)>
    where
        F: FnOnce() -> Result<Pipeline> + Send + 'static,
    {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (surface_tx, surface_rx) = watch::channel(None);

        let worker = std::thread::Builder::new()
            .name("pipeline-worker".into())
            .spawn(move || run_worker(factory, request_rx, surface_tx, ready_tx))
            .context("Failed to spawn pipeline worker")?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = tokio::task::spawn_blocking(move || worker.join()).await;
                return Err(err);
            }
            Err(_) => return Err(anyhow!("Pipeline worker exited during setup")),
        }

        let period = config.tick_period();
        let started = Instant::now();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stream_tx, stream_rx) = mpsc::channel(1);

        tracing::info!(
            "Starting frame loop at {} fps ({:.1}ms period)",
            config.frame_rate,
            period.as_secs_f64() * 1000.0
        );

        let capture_task = tokio::spawn(capture_surface(
            surface_rx,
            stream_tx,
            period,
            shutdown_rx.clone(),
            started,
        ));

        let frame_loop = FrameLoop {
            requests: request_tx,
            shutdown: shutdown_rx,
            period,
            cycle_timeout: config.cycle_timeout,
            started,
            stats: LoopStats::default(),
            totals: CycleTimings::default(),
        };
        let loop_task = tokio::spawn(frame_loop.run());

        let handle = LoopHandle {
            shutdown: shutdown_tx,
            loop_task,
            capture_task,
            worker,
        };
        Ok((handle, OutputStream::new(stream_rx)))
    }

    async fn run(mut self) -> LoopStats {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.stats.ticks += 1;

            let timestamp_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = CycleRequest {
                timestamp_ms,
                reply: reply_tx,
            };
            let requests = &self.requests;
            let cycle = async move {
                requests.send(request).await.ok()?;
                reply_rx.await.ok()
            };

            let result = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                result = time::timeout(self.cycle_timeout, cycle) => result,
            };

            match result {
                Ok(Some(CycleOutcome::Rendered { timings, .. })) => {
                    self.record(timings);
                }
                Ok(Some(CycleOutcome::Skipped(reason))) => {
                    self.stats.skipped += 1;
                    tracing::debug!("Skipped cycle at {:.1}ms: {}", timestamp_ms, reason);
                }
                Ok(None) => {
                    tracing::error!("Pipeline worker is gone, stopping frame loop");
                    break;
                }
                Err(_) => {
                    self.stats.timed_out += 1;
                    tracing::warn!(
                        "Cycle at {:.1}ms did not finish within {:?}",
                        timestamp_ms,
                        self.cycle_timeout
                    );
                }
            }
        }

        self.stats
    }

    fn record(&mut self, timings: CycleTimings) {
        self.stats.rendered += 1;
        self.totals.capture += timings.capture;
        self.totals.segment += timings.segment;
        self.totals.copy += timings.copy;
        self.totals.composite += timings.composite;

        let frame_count = self.stats.rendered;
        if frame_count % STATS_INTERVAL != 0 {
            return;
        }

        let avg_ms = |total: Duration| total.as_secs_f64() * 1000.0 / frame_count as f64;
        let total_ms = avg_ms(self.totals.total());
        tracing::info!(
            "Frame {}: capture={:.1}ms, segment={:.1}ms, copy={:.1}ms, composite={:.1}ms, total={:.1}ms, fps={:.1}, skipped={}, timed_out={}",
            frame_count,
            avg_ms(self.totals.capture),
            avg_ms(self.totals.segment),
            avg_ms(self.totals.copy),
            avg_ms(self.totals.composite),
            total_ms,
            if total_ms > 0.0 { 1000.0 / total_ms } else { 0.0 },
            self.stats.skipped,
            self.stats.timed_out
        );
    }
}

/// Owns the pipeline for its whole life and serves cycle requests in order
///
/// Returns how many frames were published after their tick stopped waiting.
fn run_worker<F>(
    factory: F,
    mut requests: mpsc::Receiver<CycleRequest>,
    surface: watch::Sender<SharedSurface>,
    ready: oneshot::Sender<Result<()>>,
) -> u64
where
    F: FnOnce() -> Result<Pipeline>,
{
    let mut pipeline = match factory() {
        Ok(pipeline) => {
            let _ = ready.send(Ok(()));
            pipeline
        }
        Err(err) => {
            tracing::error!("Pipeline setup failed: {:#}", err);
            let _ = ready.send(Err(err));
            return 0;
        }
    };

    let mut late_rendered = 0;
    while let Some(request) = requests.blocking_recv() {
        // Queued behind a slow cycle and already given up on
        if request.reply.is_closed() {
            tracing::debug!("Dropping cycle at {:.1}ms, nobody is waiting", request.timestamp_ms);
            continue;
        }

        let outcome = pipeline.run_cycle(request.timestamp_ms);
        let rendered = match &outcome {
            CycleOutcome::Rendered { image, .. } => {
                surface.send_replace(Some(Arc::clone(image)));
                true
            }
            CycleOutcome::Skipped(_) => false,
        };

        if request.reply.send(outcome).is_err() {
            tracing::debug!(
                "Cycle at {:.1}ms finished after its tick gave up waiting",
                request.timestamp_ms
            );
            if rendered {
                late_rendered += 1;
            }
        }
    }

    pipeline.shutdown();
    tracing::info!("Pipeline worker stopped");
    late_rendered
}

/// Sample the output surface once per period into the stream
async fn capture_surface(
    surface: watch::Receiver<SharedSurface>,
    stream: mpsc::Sender<OutputFrame>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    started: Instant,
) -> u64 {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        // The worker owns the sender; once it is gone there is nothing left to capture
        if surface.has_changed().is_err() {
            break;
        }
        let Some(image) = surface.borrow().clone() else {
            continue;
        };

        sequence += 1;
        let frame = OutputFrame {
            image,
            sequence,
            timestamp: started.elapsed(),
        };
        match stream.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Output consumer is behind, dropping capture {}", sequence);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    sequence
}
