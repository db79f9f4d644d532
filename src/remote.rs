//! # Remote Live-Session Collaborator
//!
//! The send/receive interface between the consultation core and the remote
//! conversational audio service. The core only depends on the shapes exchanged:
//! outbound frames go out fire-and-forget; the remote side reports back through
//! an event stream (opened, inbound frame, closed, error). Protocol internals
//! beyond these shapes are not modeled here.
//!
//! ## Transport:
//! `LiveApiConnector` implements the collaborator over a WebSocket connection
//! (tokio-tungstenite). Opening is fully asynchronous: `connect` returns
//! immediately and resolution arrives as the first event, so a session start
//! never blocks the caller.

use crate::audio::codec::{InboundFrame, OutboundFrame};
use crate::config::RemoteConfig;
use crate::error::ConsultError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Events the remote session reports back to the session controller.
///
/// `Frame` may arrive zero or more times between `Opened` and `Closed`/`Error`.
#[derive(Debug)]
pub enum RemoteEvent {
    /// The session opened; the handle is the send path for outbound frames.
    Opened(RemoteHandle),

    /// One synthesized-speech frame arrived.
    Frame(InboundFrame),

    /// The remote side closed the session.
    Closed,

    /// The session failed to open, or failed while connected.
    Error(String),
}

/// Commands the handle forwards to the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    Frame(OutboundFrame),
    Close,
}

/// Send-path handle for an open remote session.
///
/// Cloneable; the capture loop holds one clone, the controller another. Sends
/// are fire-and-forget into the transport task, so a tick never waits on the
/// socket. After `close()` every further send fails and the frame is dropped.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    closed: Arc<AtomicBool>,
}

impl RemoteHandle {
    pub fn new(commands: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self {
            commands,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hand one outbound frame to the transport. No acknowledgment; a failure
    /// costs this frame only.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), ConsultError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsultError::SendFailure("session closed".to_string()));
        }

        self.commands
            .send(TransportCommand::Frame(frame))
            .map_err(|_| ConsultError::SendFailure("transport task gone".to_string()))
    }

    /// Ask the transport to close the session. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(TransportCommand::Close);
        }
    }
}

/// Opens remote sessions. The controller only depends on this seam, so tests
/// substitute scripted connectors.
pub trait RemoteConnector: Send + Sync {
    /// Begin opening a session. Resolution (`Opened` or `Error`) and all
    /// subsequent session events are delivered over `events`.
    fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>);
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// First message after the socket opens: session configuration.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: SessionSetup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub response_modalities: Vec<String>,
    pub voice_name: String,
    pub system_instruction: String,
}

/// Outbound realtime audio: one encoded capture block.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media: MediaBlob,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// Base64-encoded signed 16-bit little-endian PCM
    pub data: String,

    /// e.g. "audio/pcm;rate=16000"
    pub mime_type: String,
}

/// Inbound server message. Only the parts the core consumes are modeled;
/// unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,

    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<TurnPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPart {
    #[serde(default)]
    pub inline_data: Option<MediaBlob>,
}

/// Pull the declared sample rate out of a PCM mime type such as
/// "audio/pcm;rate=24000".
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Extract the inbound audio frames carried by one server message.
///
/// Frames missing a parseable rate fall back to the session's playback rate
/// (the rate the collaborator is contracted to synthesize at).
pub fn inbound_frames(message: &ServerMessage, default_rate: u32) -> Vec<InboundFrame> {
    let Some(turn) = message
        .server_content
        .as_ref()
        .and_then(|content| content.model_turn.as_ref())
    else {
        return Vec::new();
    };

    turn.parts
        .iter()
        .filter_map(|part| part.inline_data.as_ref())
        .map(|blob| InboundFrame {
            data: blob.data.clone(),
            sample_rate: mime_sample_rate(&blob.mime_type).unwrap_or(default_rate),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Remote collaborator over a live WebSocket API.
pub struct LiveApiConnector {
    config: RemoteConfig,
    playback_sample_rate: u32,
}

impl LiveApiConnector {
    pub fn new(config: RemoteConfig, playback_sample_rate: u32) -> Self {
        Self {
            config,
            playback_sample_rate,
        }
    }
}

impl RemoteConnector for LiveApiConnector {
    fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>) {
        let config = self.config.clone();
        let playback_rate = self.playback_sample_rate;

        tokio::spawn(async move {
            let api_key = match std::env::var(&config.api_key_env) {
                Ok(key) => key,
                Err(_) => {
                    let _ = events.send(RemoteEvent::Error(format!(
                        "API key environment variable {} is not set",
                        config.api_key_env
                    )));
                    return;
                }
            };

            let url = format!("{}?key={}", config.endpoint, api_key);
            let (stream, _response) = match connect_async(&url).await {
                Ok(ok) => ok,
                Err(err) => {
                    let _ = events.send(RemoteEvent::Error(format!("connect failed: {}", err)));
                    return;
                }
            };

            info!("remote live session socket opened");
            let (mut writer, mut reader) = stream.split();

            // Session configuration goes out before any audio
            let setup = SetupMessage {
                setup: SessionSetup {
                    model: config.model.clone(),
                    response_modalities: vec!["AUDIO".to_string()],
                    voice_name: config.voice.clone(),
                    system_instruction: config.system_instruction.clone(),
                },
            };
            let setup_json = match serde_json::to_string(&setup) {
                Ok(json) => json,
                Err(err) => {
                    let _ = events.send(RemoteEvent::Error(format!("setup encode failed: {}", err)));
                    return;
                }
            };
            if let Err(err) = writer.send(Message::Text(setup_json.into())).await {
                let _ = events.send(RemoteEvent::Error(format!("setup send failed: {}", err)));
                return;
            }

            let (command_tx, mut command_rx) = mpsc::unbounded_channel();
            let handle = RemoteHandle::new(command_tx);
            if events.send(RemoteEvent::Opened(handle)).is_err() {
                return; // controller gone, nothing to stream for
            }

            // Writer task: outbound frames and the explicit close
            let writer_task = tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    match command {
                        TransportCommand::Frame(frame) => {
                            let message = RealtimeInputMessage {
                                realtime_input: RealtimeInput {
                                    media: MediaBlob {
                                        data: frame.data,
                                        mime_type: format!("audio/pcm;rate={}", frame.sample_rate),
                                    },
                                },
                            };
                            match serde_json::to_string(&message) {
                                Ok(json) => {
                                    if let Err(err) = writer.send(Message::Text(json.into())).await {
                                        warn!("outbound frame send failed: {}", err);
                                        break;
                                    }
                                }
                                Err(err) => warn!("outbound frame encode failed: {}", err),
                            }
                        }
                        TransportCommand::Close => {
                            let _ = writer.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            // Reader loop: inbound frames and session termination
            while let Some(incoming) = reader.next().await {
                match incoming {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                for frame in inbound_frames(&message, playback_rate) {
                                    if events.send(RemoteEvent::Frame(frame)).is_err() {
                                        writer_task.abort();
                                        return;
                                    }
                                }
                            }
                            Err(err) => debug!("unrecognized server message: {}", err),
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        info!("remote live session closed: {:?}", reason);
                        let _ = events.send(RemoteEvent::Closed);
                        break;
                    }
                    Ok(_) => {} // ping/pong/binary frames are transport noise here
                    Err(err) => {
                        let _ = events.send(RemoteEvent::Error(format!("transport error: {}", err)));
                        break;
                    }
                }
            }

            writer_task.abort();
        });
    }
}
