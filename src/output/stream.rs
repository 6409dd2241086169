use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One capture of the output surface
#[derive(Debug, Clone)]
pub struct OutputFrame {
    pub image: Arc<RgbaImage>,
    /// Capture counter, starting at 1
    pub sequence: u64,
    /// Time since the loop started
    pub timestamp: Duration,
}

/// Live stream of output surface captures, taken at the loop's frame rate
///
/// Holds at most one pending capture. A consumer that falls behind misses
/// captures instead of slowing the loop down.
pub struct OutputStream {
    receiver: mpsc::Receiver<OutputFrame>,
}

impl OutputStream {
    pub(crate) fn new(receiver: mpsc::Receiver<OutputFrame>) -> Self {
        Self { receiver }
    }

    /// Wait for the next capture. Returns `None` once the loop has stopped.
    pub async fn next(&mut self) -> Option<OutputFrame> {
        self.receiver.recv().await
    }
}
