//! Live voice session lifecycle: Idle -> Opening -> Active -> Closing -> Idle.
//!
//! The controller is owned by a single task (the console loop). Asynchronous
//! completions come back as [`SessionEvent`]s tagged with the generation that
//! produced them; anything from an older generation is discarded.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::capture::{Microphone, RawSamples};
use crate::audio::pipe::{spawn_capture_pipe, CapturePipe};
use crate::audio::playback::PlaybackHandle;
use crate::audio::processing::decode_pcm16;
use crate::audio::PLAYBACK_SAMPLE_RATE;
use crate::engine::{LiveConfig, LiveConnection, LiveConnector, LiveEvent, LiveSessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Active,
    Closing,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Opening | SessionState::Active)
    }
}

pub enum SessionEvent {
    Connected {
        generation: u64,
        result: Result<LiveConnection>,
    },
    Opened {
        generation: u64,
    },
    Closed {
        generation: u64,
    },
    Failed {
        generation: u64,
        message: String,
    },
}

/// What the front end should tell the user after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Active,
    Ended { error: Option<String> },
}

pub struct SessionController<C: LiveConnector, M: Microphone> {
    connector: Arc<C>,
    mic: M,
    playback: PlaybackHandle,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: SessionState,
    generation: u64,
    handle: Option<LiveSessionHandle>,
    raw: Option<RawSamples>,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: LiveConnector, M: Microphone> SessionController<C, M> {
    pub fn new(
        connector: Arc<C>,
        mic: M,
        playback: PlaybackHandle,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            connector,
            mic,
            playback,
            events_tx,
            state: SessionState::Idle,
            generation: 0,
            handle: None,
            raw: None,
            tasks: Vec::new(),
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn microphone(&self) -> &M {
        &self.mic
    }

    /// Open a session. One that is already opening or active is fully closed
    /// instead, so two sessions never run at once.
    ///
    /// A microphone failure is returned to the caller and leaves the
    /// controller Idle.
    pub fn start(&mut self, config: LiveConfig) -> Result<()> {
        if self.state.is_live() {
            tracing::info!("Session {} is {:?}; closing it", self.generation, self.state);
            self.teardown();
            return Ok(());
        }

        self.playback.stop_all();
        self.generation += 1;
        let generation = self.generation;

        let raw = self.mic.open()?;
        self.raw = Some(raw);
        self.state = SessionState::Opening;
        self.playback.begin_stream(generation);
        tracing::info!("Opening live session {}", generation);

        let connector = Arc::clone(&self.connector);
        let events_tx = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = connector.connect(config).await;
            let _ = events_tx.send(SessionEvent::Connected { generation, result });
        }));
        Ok(())
    }

    /// Close the session if one is opening or active.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.teardown();
    }

    /// Start or stop, returning the state the controller moved to.
    pub fn toggle(&mut self, config: LiveConfig) -> Result<SessionState> {
        self.start(config)?;
        Ok(self.state)
    }

    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        match event {
            SessionEvent::Connected { generation, result } => {
                if generation != self.generation || self.state != SessionState::Opening {
                    if let Ok(mut stale) = result {
                        tracing::debug!("Discarding connection for stale session {}", generation);
                        stale.handle.close();
                    }
                    return None;
                }
                match result {
                    Ok(connection) => {
                        self.attach(generation, connection);
                        None
                    }
                    Err(e) => {
                        tracing::error!("Live session failed to connect: {:#}", e);
                        self.teardown();
                        Some(SessionUpdate::Ended {
                            error: Some(format!("{:#}", e)),
                        })
                    }
                }
            }
            SessionEvent::Opened { generation } => {
                if generation != self.generation || self.state != SessionState::Opening {
                    return None;
                }
                match self.start_capture() {
                    Ok(()) => {
                        self.state = SessionState::Active;
                        tracing::info!("Live session {} active", generation);
                        Some(SessionUpdate::Active)
                    }
                    Err(e) => {
                        tracing::error!("Failed to start capture: {:#}", e);
                        self.teardown();
                        Some(SessionUpdate::Ended {
                            error: Some(format!("{:#}", e)),
                        })
                    }
                }
            }
            SessionEvent::Closed { generation } => {
                if generation != self.generation || !self.state.is_live() {
                    return None;
                }
                self.teardown();
                Some(SessionUpdate::Ended { error: None })
            }
            SessionEvent::Failed { generation, message } => {
                if generation != self.generation || !self.state.is_live() {
                    return None;
                }
                tracing::error!("Live session error: {}", message);
                self.teardown();
                Some(SessionUpdate::Ended {
                    error: Some(message),
                })
            }
        }
    }

    fn attach(&mut self, generation: u64, connection: LiveConnection) {
        let LiveConnection { handle, mut events } = connection;
        self.handle = Some(handle);

        let playback = self.playback.clone();
        let events_tx = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LiveEvent::SetupComplete => {
                        let _ = events_tx.send(SessionEvent::Opened { generation });
                    }
                    LiveEvent::Audio(data) => match decode_pcm16(&data, PLAYBACK_SAMPLE_RATE, 1) {
                        Ok(chunk) => playback.stream_chunk(generation, chunk),
                        Err(e) => tracing::debug!("Dropping undecodable chunk: {}", e),
                    },
                    LiveEvent::Interrupted => playback.interrupt(generation),
                    LiveEvent::TurnComplete => tracing::debug!("Model turn complete"),
                    LiveEvent::Closed => break,
                    LiveEvent::Error(message) => {
                        let _ = events_tx.send(SessionEvent::Failed { generation, message });
                        return;
                    }
                }
            }
            let _ = events_tx.send(SessionEvent::Closed { generation });
        }));
    }

    fn start_capture(&mut self) -> Result<()> {
        let raw = self
            .raw
            .take()
            .ok_or_else(|| anyhow::anyhow!("microphone stream already consumed"))?;
        let sink = self
            .handle
            .as_ref()
            .and_then(|h| h.frame_sender())
            .ok_or_else(|| anyhow::anyhow!("live session is not connected"))?;

        let pipe = CapturePipe::new(self.mic.sample_rate())?;
        self.tasks.push(spawn_capture_pipe(pipe, raw, sink));
        self.mic.set_forwarding(true);
        Ok(())
    }

    fn teardown(&mut self) {
        self.state = SessionState::Closing;

        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.mic.close();
        self.raw = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.playback.end_stream(self.generation);

        self.state = SessionState::Idle;
        tracing::info!("Live session {} closed", self.generation);
    }
}
