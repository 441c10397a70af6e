//! Remote model collaborators: text generation, one-shot speech synthesis and
//! the bidirectional live voice session.

pub mod gemini;
pub mod gemini_live;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::WireFrame;

/// One scripted generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub model: String,
    pub system_instruction: String,
    pub prompt: String,
    pub temperature: f32,
}

/// Raw synthesis result: base64 PCM16 LE, mono, 24kHz.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechPayload {
    pub data: String,
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate text. An empty string means the model produced nothing.
    async fn generate_text(&self, request: TextRequest) -> Result<String>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns `None` when the response carried no audio.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Option<SpeechPayload>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Events surfaced by a live session, in network-receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    SetupComplete,
    /// Base64 PCM16 LE audio at 24kHz.
    Audio(String),
    Interrupted,
    TurnComplete,
    Closed,
    Error(String),
}

/// Sender side of a live session.
///
/// `close` is idempotent; sending after close is an error the caller may ignore.
#[derive(Debug)]
pub struct LiveSessionHandle {
    outbound: Option<mpsc::UnboundedSender<WireFrame>>,
}

impl LiveSessionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<WireFrame>) -> Self {
        Self {
            outbound: Some(outbound),
        }
    }

    pub fn send(&self, frame: WireFrame) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            anyhow::bail!("live session is closed");
        };
        outbound
            .send(frame)
            .map_err(|_| anyhow::anyhow!("live session writer has stopped"))
    }

    /// A cheap sender for the capture pipe. `None` once closed.
    pub fn frame_sender(&self) -> Option<mpsc::UnboundedSender<WireFrame>> {
        self.outbound.clone()
    }

    /// Dropping the last outbound sender makes the writer close the socket.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            tracing::debug!("Live session handle closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }
}

pub struct LiveConnection {
    pub handle: LiveSessionHandle,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync + 'static {
    async fn connect(&self, config: LiveConfig) -> Result<LiveConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processing::encode_wire_frame;

    #[test]
    fn close_is_idempotent_and_stops_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = LiveSessionHandle::new(tx);

        handle.send(encode_wire_frame(&[0.0; 4])).unwrap();
        assert!(rx.try_recv().is_ok());

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert!(handle.send(encode_wire_frame(&[0.0; 4])).is_err());
        assert!(handle.frame_sender().is_none());
    }
}
