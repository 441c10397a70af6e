//! Gemini Live (`BidiGenerateContent`) WebSocket client.
//!
//! One writer task drains outbound capture frames into the socket; one reader
//! task turns server messages into [`LiveEvent`]s in receipt order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::gemini::{Content, GenerationConfig, Part, SpeechConfig};
use super::{LiveConfig, LiveConnection, LiveConnector, LiveEvent, LiveSessionHandle};
use crate::audio::WireFrame;

pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

fn setup_message(config: &LiveConfig) -> Result<String> {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };
    let message = SetupMessage {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: Some(vec!["AUDIO".to_string()]),
                speech_config: Some(SpeechConfig::voice(&config.voice)),
                ..Default::default()
            },
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(config.system_instruction.clone())],
            },
        },
    };
    Ok(serde_json::to_string(&message)?)
}

fn realtime_input(frame: &WireFrame) -> Result<String> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type: frame.mime_type,
                data: &frame.data,
            }],
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Translate one server message. Every inline audio part of a model turn is
/// forwarded, in order, before the interruption and turn-complete flags.
fn parse_server_message(raw: &str) -> Result<Vec<LiveEvent>> {
    let message: ServerMessage =
        serde_json::from_str(raw).context("Malformed live server message")?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(LiveEvent::SetupComplete);
    }
    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .map(|d| LiveEvent::Audio(d.data)),
            );
        }
        if content.interrupted {
            events.push(LiveEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(LiveEvent::TurnComplete);
        }
    }
    Ok(events)
}

pub struct GeminiLiveConnector {
    url: String,
    api_key: String,
}

impl GeminiLiveConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_LIVE_URL.to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, config: LiveConfig) -> Result<LiveConnection> {
        let url = format!("{}?key={}", self.url, self.api_key);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("Failed to open live session")?;
        tracing::info!("Live socket connected (model: {})", config.model);

        let (mut sink, mut stream) = socket.split();
        sink.send(Message::Text(setup_message(&config)?))
            .await
            .context("Failed to send live session setup")?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireFrame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match realtime_input(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Skipping capture frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!("Live writer stopping: {}", e);
                    return;
                }
            }
            // All senders dropped: the session was closed locally.
            let _ = sink.send(Message::Close(None)).await;
            tracing::debug!("Live writer closed the socket");
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let raw = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!("Live session closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = events_tx.send(LiveEvent::Error(e.to_string()));
                        return;
                    }
                };
                match parse_server_message(&raw) {
                    Ok(events) => {
                        for event in events {
                            if events_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::debug!("{:#}", e),
                }
            }
            let _ = events_tx.send(LiveEvent::Closed);
        });

        Ok(LiveConnection {
            handle: LiveSessionHandle::new(outbound_tx),
            events: events_rx,
        })
    }
}
