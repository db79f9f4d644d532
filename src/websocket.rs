//! # WebSocket Client Bridge
//!
//! Connects a browser client to the consultation session core. The client
//! streams its microphone audio here, and this bridge is also where scheduled
//! playback audio and periodic status updates are pushed back out.
//!
//! ## WebSocket Protocol:
//! - **Client → Server, binary**: raw signed 16-bit little-endian PCM at the
//!   configured capture rate (one message per capture buffer)
//! - **Client → Server, text**: JSON control messages (`start`, `stop`, `pong`)
//! - **Server → Client, text**: JSON `audio` messages (base64 PCM16 with a
//!   playback start time), periodic `status` updates, `error` and `ping`
//!
//! ## Device bridging:
//! On connect the bridge installs a microphone feed and a playback sink into
//! the shared `ChannelDeviceProvider`; a subsequent session start acquires them
//! as its capture and playback devices. One client at a time: a new connection
//! replaces any previously installed endpoints.
//!
//! ## Backpressure:
//! The microphone feed is a bounded queue. When the session core falls behind,
//! incoming audio is dropped rather than buffered without bound; real-time
//! audio that arrives late is worthless anyway.

use crate::audio::codec::{self, encode_block};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON messages exchanged with the client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Client requests a consultation start
    #[serde(rename = "start")]
    Start,

    /// Client requests a consultation stop
    #[serde(rename = "stop")]
    Stop,

    /// Scheduled playback audio for the client
    #[serde(rename = "audio")]
    Audio {
        /// Base64-encoded signed 16-bit little-endian PCM
        data: String,
        /// Sample rate of the payload (Hz)
        sample_rate: u32,
        /// When to start playback, in seconds on the playback clock
        start: f64,
    },

    /// Periodic session status push
    #[serde(rename = "status")]
    Status {
        state: String,
        consultation_id: Option<Uuid>,
        /// Most recent input volume (RMS of the last capture block)
        input_volume: f32,
        frames_sent: u64,
        frames_dropped: u64,
        chunks_scheduled: u64,
        decode_errors: u64,
    },

    /// Error messages
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Heartbeat ping from the server
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat pong from the client
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// WebSocket actor bridging one client to the session core.
pub struct ConsultWebSocket {
    state: web::Data<AppState>,

    /// Id of this client's device installation, 0 until `started` runs
    client_id: u64,

    /// Sender side of the installed microphone feed
    mic_tx: Option<mpsc::Sender<Vec<f32>>>,

    /// Task forwarding scheduled playback chunks to this client
    playback_pump: Option<tokio::task::JoinHandle<()>>,

    /// Last heartbeat time
    last_heartbeat: Instant,
}

impl ConsultWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            client_id: 0,
            mic_tx: None,
            playback_pump: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Forward one binary microphone buffer into the capture feed.
    fn handle_audio_data(&mut self, data: &[u8]) -> Result<(), String> {
        let samples = codec::samples_from_pcm16(data).map_err(|e| e.to_string())?;

        let Some(mic_tx) = &self.mic_tx else {
            return Err("microphone feed not installed".to_string());
        };

        match mic_tx.try_send(samples) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Queue full: drop this buffer, the feed stays live
                debug!("capture feed full, dropping {} bytes of audio", data.len());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // No session holds the feed right now; audio outside a
                // session is silently discarded
                Ok(())
            }
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        let error_msg = WsMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        };

        if let Ok(json) = serde_json::to_string(&error_msg) {
            ctx.text(json);
        }

        warn!("WebSocket error {}: {}", code, message);
    }

    fn push_status(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let status = self.state.consult.status();
        let counters = self.state.consult.counters();

        let msg = WsMessage::Status {
            state: status.state.as_str().to_string(),
            consultation_id: status.consultation_id,
            input_volume: self.state.consult.volume(),
            frames_sent: counters.frames_sent,
            frames_dropped: counters.frames_dropped,
            chunks_scheduled: counters.chunks_scheduled,
            decode_errors: counters.decode_errors,
        };

        if let Ok(json) = serde_json::to_string(&msg) {
            ctx.text(json);
        }
    }
}

/// Message for sending text to the WebSocket client from spawned tasks.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

impl Actor for ConsultWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Install device endpoints and start the background pumps.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket client connected");
        self.state.increment_connected_clients();

        let config = self.state.get_config();
        let (client_id, mic_tx, mut chunk_rx) = self
            .state
            .devices
            .install_client(config.audio.capture_queue_blocks);
        self.client_id = client_id;
        self.mic_tx = Some(mic_tx);

        // Forward scheduled playback chunks to the client as JSON audio
        // messages
        let addr = ctx.address();
        self.playback_pump = Some(tokio::spawn(async move {
            while let Some(scheduled) = chunk_rx.recv().await {
                let frame = encode_block(&scheduled.chunk.samples, scheduled.chunk.sample_rate);
                let msg = WsMessage::Audio {
                    data: frame.data,
                    sample_rate: frame.sample_rate,
                    start: scheduled.start,
                };
                if let Ok(json) = serde_json::to_string(&msg) {
                    addr.do_send(SendText(json));
                }
            }
        }));

        // Heartbeat timer
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping_msg = WsMessage::Ping {
                timestamp: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            };

            if let Ok(json) = serde_json::to_string(&ping_msg) {
                ctx.text(json);
            }
        });

        // Periodic status pushes (session state, input volume, counters)
        let status_interval = Duration::from_millis(config.server.status_interval_ms);
        ctx.run_interval(status_interval, |act, ctx| {
            act.push_status(ctx);
        });
    }

    /// Tear down the client's endpoints. When this client still owns the
    /// installed devices an active session loses its audio path, so it is
    /// stopped as well. A reconnected client may already have replaced the
    /// endpoints; a stale disconnect then leaves the new session untouched.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("WebSocket client disconnected");

        if let Some(pump) = self.playback_pump.take() {
            pump.abort();
        }

        self.mic_tx = None;
        if self.state.devices.clear_client(self.client_id) {
            self.state.consult.stop();
        }
        self.state.decrement_connected_clients();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConsultWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsMessage>(&text) {
                Ok(WsMessage::Start) => {
                    info!("consultation start requested over WebSocket");
                    self.state.consult.start();
                    self.push_status(ctx);
                }
                Ok(WsMessage::Stop) => {
                    info!("consultation stop requested over WebSocket");
                    self.state.consult.stop();
                    self.push_status(ctx);
                }
                Ok(WsMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Ok(_) => {
                    warn!("received unexpected message type from client");
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                if let Err(err) = self.handle_audio_data(&data) {
                    self.send_error(ctx, "audio_error", &err);
                }
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for ConsultWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a `ConsultWebSocket` actor.
pub async fn consult_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    ws::start(ConsultWebSocket::new(app_state), &req, stream)
}
