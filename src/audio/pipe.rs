//! Capture pipe: raw microphone blocks in, encoded wire frames out.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::RawSamples;
use super::processing::{encode_wire_frame, StreamResampler};
use super::{WireFrame, CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE};

/// Destination of encoded capture frames, typically a live session.
pub trait FrameSink: Send + 'static {
    fn submit(&self, frame: WireFrame) -> Result<()>;
}

impl FrameSink for mpsc::UnboundedSender<WireFrame> {
    fn submit(&self, frame: WireFrame) -> Result<()> {
        self.send(frame)
            .map_err(|_| anyhow::anyhow!("frame receiver dropped"))
    }
}

/// Re-blocks a microphone stream into fixed 16kHz frames and encodes them.
pub struct CapturePipe {
    resampler: StreamResampler,
    pending: Vec<f32>,
}

impl CapturePipe {
    pub fn new(device_sample_rate: u32) -> Result<Self> {
        Ok(Self {
            resampler: StreamResampler::new(device_sample_rate, CAPTURE_SAMPLE_RATE)?,
            pending: Vec::with_capacity(CAPTURE_FRAME_SIZE * 2),
        })
    }

    /// Encode one complete capture frame.
    pub fn on_frame(frame: &[f32]) -> WireFrame {
        encode_wire_frame(frame)
    }

    /// Number of 16kHz samples waiting for a full frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, block: &[f32]) -> Vec<WireFrame> {
        match self.resampler.process(block) {
            Ok(samples) => self.pending.extend(samples),
            Err(e) => {
                tracing::warn!("Dropping capture block: {}", e);
                return Vec::new();
            }
        }

        let complete = self.pending.len() / CAPTURE_FRAME_SIZE;
        let frames: Vec<WireFrame> = self
            .pending
            .chunks_exact(CAPTURE_FRAME_SIZE)
            .map(Self::on_frame)
            .collect();
        self.pending.drain(..complete * CAPTURE_FRAME_SIZE);
        frames
    }
}

/// Forward microphone blocks to `sink` until the raw stream ends.
///
/// Sending is best effort: a failed submit is logged and the frame is lost.
pub fn spawn_capture_pipe<S: FrameSink>(
    mut pipe: CapturePipe,
    mut raw: RawSamples,
    sink: S,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sent: u64 = 0;
        while let Some(block) = raw.recv().await {
            for frame in pipe.push(&block) {
                match sink.submit(frame) {
                    Ok(()) => sent += 1,
                    Err(e) => tracing::trace!("Capture frame not delivered: {}", e),
                }
            }
        }
        tracing::debug!("Capture pipe finished after {} frames", sent);
    })
}
