pub mod capture;
pub mod output;
pub mod pipe;
pub mod playback;
pub mod processing;
pub mod scheduler;

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::RuntimeFlavor;

/// Sample rate the remote service expects for microphone input.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
/// Sample rate of every audio payload the remote service sends back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;
/// Samples per capture frame handed to the outbound sender.
pub const CAPTURE_FRAME_SIZE: usize = 4096;
/// MIME descriptor attached to every outbound frame.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

#[derive(Debug, Error)]
pub enum AudioError {
    /// Microphone access denied or no usable input device.
    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    #[error("Malformed audio payload: {0}")]
    Decode(String),

    #[error("Audio output device error: {0}")]
    Device(String),
}

/// Run a blocking wait on an audio thread handshake.
///
/// On a multi-threaded runtime the worker hands its other tasks off first;
/// elsewhere the closure simply runs in place.
pub(crate) fn wait_blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Decoded, ready-to-play PCM audio. One sample buffer per channel.
///
/// Cloning is cheap: the sample data is shared, never copied or mutated.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    channels: Arc<[Vec<f32>]>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels: channels.into(),
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// An encoded capture frame ready for the outbound channel of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub data: String,
    pub mime_type: &'static str,
}
