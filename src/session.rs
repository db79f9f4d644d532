//! # Consultation Session Lifecycle
//!
//! Owns the full state machine of a live voice consultation and the wiring
//! between capture loop, remote session and playback scheduler.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: no session; waiting for a start request
//! 2. **Connecting**: device contexts acquired, remote session opening
//! 3. **Connected**: capture loop running, inbound frames being scheduled
//! 4. **Closed**: stopped (by the user or the remote), resources released
//! 5. **Error**: device or transport failure; a new start request may re-enter
//!    Connecting
//!
//! ## Concurrency model:
//! All controller state lives inside one spawned task that drains a single
//! event channel. Start/stop requests and remote-session callbacks are just
//! events on that channel, so no two handlers for the same controller ever run
//! concurrently and none of the controller's state needs a lock. Async
//! completions that land after the state has moved on (a late open after
//! stop(), a frame after teardown) are checked against the current state and
//! connection epoch, then discarded.

use crate::audio::capture::AudioCaptureLoop;
use crate::audio::codec::{self, InboundFrame};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::volume::VolumeCell;
use crate::config::AudioSettings;
use crate::device::{CaptureDevice, DeviceProvider, PlaybackDevice};
use crate::error::ConsultError;
use crate::remote::{RemoteConnector, RemoteEvent, RemoteHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current state of the consultation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; waiting for a start request
    Idle,
    /// Devices acquired, remote session opening
    Connecting,
    /// Live: audio flowing both ways
    Connected,
    /// Session ended and torn down
    Closed,
    /// Device or transport failure; requires a new start request
    Error,
}

impl SessionState {
    /// Status string used in API responses.
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        }
    }
}

/// Per-session stream counters for the status surface.
///
/// Single-writer per field (capture loop writes the frame counters, the
/// controller task the rest); atomics keep the readers lock-free.
#[derive(Debug, Default)]
pub struct SessionCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_scheduled: AtomicU64,
    decode_errors: AtomicU64,
}

impl SessionCounters {
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_scheduled(&self) {
        self.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero everything at the start of a new session.
    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CountersSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub decode_errors: u64,
}

/// Published session status, readable without touching the controller task.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub consultation_id: Option<Uuid>,
}

/// Everything the controller task reacts to.
#[derive(Debug)]
enum ControllerEvent {
    Start,
    Stop,
    Remote { epoch: u64, event: RemoteEvent },
}

/// Cloneable handle to a running session controller.
///
/// `start`/`stop` are requests, not synchronous transitions: they enqueue an
/// event and return. The resulting state is observable through `status()`.
#[derive(Clone)]
pub struct ConsultHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
    status: watch::Receiver<SessionStatus>,
    volume: VolumeCell,
    counters: Arc<SessionCounters>,
}

impl ConsultHandle {
    /// Request a session start. A no-op while a session is already
    /// Connecting/Connected.
    pub fn start(&self) {
        let _ = self.events.send(ControllerEvent::Start);
    }

    /// Request a stop. Safe from any state; a no-op without an active session.
    pub fn stop(&self) {
        let _ = self.events.send(ControllerEvent::Stop);
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Most recent input volume sample (visualizer read path).
    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}

/// The session state machine. Constructed and driven entirely inside its own
/// task; the outside world only sees `ConsultHandle`.
pub struct SessionLifecycleController {
    audio: AudioSettings,
    provider: Arc<dyn DeviceProvider>,
    connector: Arc<dyn RemoteConnector>,

    state: SessionState,
    /// Bumped on every start request; remote events from superseded connection
    /// attempts are discarded by comparing against it.
    epoch: u64,
    consultation_id: Option<Uuid>,

    capture_device: Option<Arc<CaptureDevice>>,
    playback_device: Option<Arc<PlaybackDevice>>,
    capture_loop: Option<AudioCaptureLoop>,
    remote: Option<RemoteHandle>,
    scheduler: PlaybackScheduler,

    volume: VolumeCell,
    counters: Arc<SessionCounters>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl SessionLifecycleController {
    /// Spawn the controller task and return its handle.
    pub fn spawn(
        audio: AudioSettings,
        provider: Arc<dyn DeviceProvider>,
        connector: Arc<dyn RemoteConnector>,
    ) -> ConsultHandle {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            consultation_id: None,
        });
        let volume = VolumeCell::new();
        let counters = Arc::new(SessionCounters::default());

        let handle = ConsultHandle {
            events: events_tx.clone(),
            status: status_rx,
            volume: volume.clone(),
            counters: counters.clone(),
        };

        let mut controller = Self {
            audio,
            provider,
            connector,
            state: SessionState::Idle,
            epoch: 0,
            consultation_id: None,
            capture_device: None,
            playback_device: None,
            capture_loop: None,
            remote: None,
            scheduler: PlaybackScheduler::new(),
            volume,
            counters,
            status_tx,
            events_tx,
        };

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                controller.handle_event(event);
            }
        });

        handle
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Start => self.handle_start(),
            ControllerEvent::Stop => self.handle_stop(),
            ControllerEvent::Remote { epoch, event } => {
                if epoch != self.epoch {
                    // A superseded connection attempt resolved late. If it
                    // resolved into an open session, close it so nothing leaks.
                    if let RemoteEvent::Opened(stale) = event {
                        debug!("closing remote session from superseded attempt");
                        stale.close();
                    }
                    return;
                }
                match event {
                    RemoteEvent::Opened(remote) => self.handle_remote_opened(remote),
                    RemoteEvent::Frame(frame) => self.handle_remote_frame(frame),
                    RemoteEvent::Closed => self.handle_remote_closed(),
                    RemoteEvent::Error(reason) => self.handle_remote_error(reason),
                }
            }
        }
    }

    /// Idle/Closed/Error → Connecting. Idempotent while a session is active.
    fn handle_start(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                debug!("start request ignored, session already active");
                return;
            }
            SessionState::Idle | SessionState::Closed | SessionState::Error => {}
        }

        self.epoch += 1;
        self.counters.reset();

        // Two independent device contexts, one per sample rate
        let capture = match self.provider.acquire_capture(self.audio.capture_sample_rate) {
            Ok(device) => device,
            Err(err) => {
                warn!("session start failed: {}", err);
                self.set_state(SessionState::Error);
                return;
            }
        };

        let playback = match self.provider.acquire_playback(self.audio.playback_sample_rate) {
            Ok(device) => device,
            Err(err) => {
                warn!("session start failed: {}", err);
                capture.release();
                self.set_state(SessionState::Error);
                return;
            }
        };

        self.capture_device = Some(capture);
        self.playback_device = Some(playback);
        self.consultation_id = Some(Uuid::new_v4());
        self.set_state(SessionState::Connecting);
        info!(
            consultation_id = %self.consultation_id.unwrap_or_default(),
            "opening live consultation session"
        );

        // Open the remote session; resolution and everything after it arrive as
        // events tagged with this attempt's epoch.
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        self.connector.connect(remote_tx);

        let events = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(event) = remote_rx.recv().await {
                if events.send(ControllerEvent::Remote { epoch, event }).is_err() {
                    break;
                }
            }
        });
    }

    /// Connecting → Connected: start the capture loop and keep the send path.
    fn handle_remote_opened(&mut self, remote: RemoteHandle) {
        if self.state != SessionState::Connecting {
            // stop() won the race against the open callback
            debug!("remote session opened after teardown, closing it");
            remote.close();
            return;
        }

        let Some(capture_device) = self.capture_device.clone() else {
            remote.close();
            return;
        };

        self.capture_loop = Some(AudioCaptureLoop::spawn(
            capture_device,
            remote.clone(),
            self.volume.clone(),
            self.audio.block_size,
            self.counters.clone(),
        ));
        self.remote = Some(remote);
        self.set_state(SessionState::Connected);
        info!("live consultation connected");
    }

    /// Decode an inbound frame and schedule it; a malformed frame costs itself,
    /// never the session.
    fn handle_remote_frame(&mut self, frame: InboundFrame) {
        if self.state != SessionState::Connected {
            debug!("discarding inbound frame outside connected state");
            return;
        }

        let Some(playback) = self.playback_device.as_ref() else {
            return;
        };

        match codec::decode_frame(&frame) {
            Ok(chunk) => {
                let now = playback.clock();
                self.scheduler.schedule_next(chunk, now, playback);
                self.counters.record_chunk_scheduled();
            }
            Err(err) => {
                warn!("dropping inbound frame: {}", ConsultError::from(err));
                self.counters.record_decode_error();
            }
        }
    }

    /// The remote side closed without an explicit stop request.
    fn handle_remote_closed(&mut self) {
        match self.state {
            SessionState::Connected => {
                info!("remote session closed, tearing down");
                self.teardown();
                self.set_state(SessionState::Closed);
            }
            SessionState::Connecting => {
                warn!("remote session closed before opening");
                self.teardown();
                self.set_state(SessionState::Error);
            }
            _ => {}
        }
    }

    fn handle_remote_error(&mut self, reason: String) {
        match self.state {
            SessionState::Connecting => {
                warn!("{}", ConsultError::TransportOpen(reason));
                self.teardown();
                self.set_state(SessionState::Error);
            }
            SessionState::Connected => {
                warn!("remote session error: {}", reason);
                self.teardown();
                self.set_state(SessionState::Error);
            }
            _ => debug!("remote error after teardown: {}", reason),
        }
    }

    /// Connected/Connecting → Closed; a no-op from Idle, Closed or Error.
    fn handle_stop(&mut self) {
        match self.state {
            SessionState::Connected | SessionState::Connecting => {
                self.teardown();
                self.set_state(SessionState::Closed);
                info!("consultation stopped");
            }
            SessionState::Idle | SessionState::Closed | SessionState::Error => {
                debug!("stop request with no active session");
            }
        }
    }

    /// Release everything, in order, tolerating partially initialized state:
    /// (1) stop the capture loop, (2) release the capture context, (3) release
    /// the playback context, (4) reset the scheduler cursor, (5) close and
    /// discard the remote handle.
    fn teardown(&mut self) {
        if let Some(capture_loop) = self.capture_loop.take() {
            capture_loop.stop();
        }

        if let Some(device) = self.capture_device.take() {
            device.release();
        }

        if let Some(device) = self.playback_device.take() {
            device.release();
            self.scheduler.reset(device.clock());
        } else {
            self.scheduler.reset(0.0);
        }

        if let Some(remote) = self.remote.take() {
            remote.close();
        }

        self.volume.clear();
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.status_tx.send(SessionStatus {
            state,
            consultation_id: self.consultation_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_block;
    use crate::device::{ChannelDeviceProvider, ScheduledChunk};
    use crate::remote::TransportCommand;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout, Duration};

    const BLOCK: usize = 256;

    fn audio_settings() -> AudioSettings {
        AudioSettings {
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            block_size: BLOCK,
            capture_queue_blocks: 8,
        }
    }

    /// Scripted remote: the test decides when the session opens, what frames
    /// arrive, and when it fails.
    #[derive(Default)]
    struct ScriptedRemote {
        events: Mutex<Option<mpsc::UnboundedSender<RemoteEvent>>>,
        connects: AtomicU64,
    }

    impl RemoteConnector for ScriptedRemote {
        fn connect(&self, events: mpsc::UnboundedSender<RemoteEvent>) {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.events.lock().unwrap() = Some(events);
        }
    }

    impl ScriptedRemote {
        fn connect_count(&self) -> u64 {
            self.connects.load(Ordering::SeqCst)
        }

        fn send(&self, event: RemoteEvent) {
            self.events
                .lock()
                .unwrap()
                .as_ref()
                .expect("connect was never called")
                .send(event)
                .unwrap();
        }

        /// Resolve the open and return the command stream the controller and
        /// capture loop will write into.
        fn open_session(&self) -> mpsc::UnboundedReceiver<TransportCommand> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.send(RemoteEvent::Opened(RemoteHandle::new(tx)));
            rx
        }
    }

    /// Device provider that remembers the contexts it handed out so tests can
    /// assert on their release state.
    #[derive(Default)]
    struct TrackingProvider {
        inner: ChannelDeviceProvider,
        capture: Mutex<Option<Arc<CaptureDevice>>>,
        playback: Mutex<Option<Arc<PlaybackDevice>>>,
        acquisitions: AtomicU64,
    }

    impl TrackingProvider {
        fn acquisition_count(&self) -> u64 {
            self.acquisitions.load(Ordering::SeqCst)
        }

        fn devices(&self) -> (Arc<CaptureDevice>, Arc<PlaybackDevice>) {
            (
                self.capture.lock().unwrap().clone().expect("no capture acquired"),
                self.playback.lock().unwrap().clone().expect("no playback acquired"),
            )
        }
    }

    impl DeviceProvider for TrackingProvider {
        fn acquire_capture(&self, sample_rate: u32) -> Result<Arc<CaptureDevice>, ConsultError> {
            let device = self.inner.acquire_capture(sample_rate)?;
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            *self.capture.lock().unwrap() = Some(device.clone());
            Ok(device)
        }

        fn acquire_playback(&self, sample_rate: u32) -> Result<Arc<PlaybackDevice>, ConsultError> {
            let device = self.inner.acquire_playback(sample_rate)?;
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            *self.playback.lock().unwrap() = Some(device.clone());
            Ok(device)
        }
    }

    async fn wait_for_state(handle: &ConsultHandle, state: SessionState) {
        timeout(Duration::from_secs(1), async {
            while handle.state() != state {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("state never became {:?}, is {:?}", state, handle.state())
        });
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !condition() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_end_to_end_consultation_flow() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let (_id, mic_tx, mut chunk_rx) = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        // start → Connecting, then the open callback fires → Connected
        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
        let mut commands = remote.open_session();
        wait_for_state(&handle, SessionState::Connected).await;
        assert!(handle.status().consultation_id.is_some());

        // three capture ticks → three outbound frames, in order
        for amplitude in [0.1f32, 0.2, 0.3] {
            mic_tx.send(vec![amplitude; BLOCK]).await.unwrap();
        }
        let mut sent = Vec::new();
        while sent.len() < 3 {
            match timeout(Duration::from_secs(1), commands.recv()).await.unwrap() {
                Some(TransportCommand::Frame(frame)) => sent.push(frame),
                other => panic!("unexpected transport command: {:?}", other),
            }
        }
        assert!(sent.iter().all(|f| f.sample_rate == 16000));

        // two inbound frames → scheduled back to back
        let frame = |amp: f32| {
            let outbound = encode_block(&vec![amp; 2400], 24000); // 0.1s at 24kHz
            InboundFrame {
                data: outbound.data,
                sample_rate: 24000,
            }
        };
        remote.send(RemoteEvent::Frame(frame(0.4)));
        remote.send(RemoteEvent::Frame(frame(0.5)));

        let first: ScheduledChunk =
            timeout(Duration::from_secs(1), chunk_rx.recv()).await.unwrap().unwrap();
        let second: ScheduledChunk =
            timeout(Duration::from_secs(1), chunk_rx.recv()).await.unwrap().unwrap();
        assert!(
            second.start >= first.start + first.chunk.duration - 1e-9,
            "second chunk overlaps the first"
        );

        // stop → Closed, both device contexts released
        handle.stop();
        wait_for_state(&handle, SessionState::Closed).await;
        let (capture, playback) = provider.devices();
        assert!(capture.is_released());
        assert!(playback.is_released());

        let counters = handle.counters();
        assert_eq!(counters.frames_sent, 3);
        assert_eq!(counters.chunks_scheduled, 2);
        assert_eq!(counters.decode_errors, 0);

        // stopping again produces the same end state
        handle.stop();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_active() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let _endpoints = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
        handle.start(); // ignored while Connecting

        let _commands = remote.open_session();
        wait_for_state(&handle, SessionState::Connected).await;
        handle.start(); // ignored while Connected
        sleep(Duration::from_millis(10)).await;

        // one device pair, one remote session
        assert_eq!(provider.acquisition_count(), 2);
        assert_eq!(remote.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_a_noop() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.stop();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), SessionState::Idle);
        assert_eq!(provider.acquisition_count(), 0);
    }

    #[tokio::test]
    async fn test_device_failure_moves_to_error_and_allows_restart() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        // No client endpoints installed: acquisition fails
        handle.start();
        wait_for_state(&handle, SessionState::Error).await;
        assert_eq!(remote.connect_count(), 0);

        // Error is not terminal: a new start with devices available connects
        let _endpoints = provider.inner.install_client(8);
        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
    }

    #[tokio::test]
    async fn test_transport_open_failure_releases_devices() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let _endpoints = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
        remote.send(RemoteEvent::Error("connect refused".to_string()));
        wait_for_state(&handle, SessionState::Error).await;

        let (capture, playback) = provider.devices();
        assert!(capture.is_released());
        assert!(playback.is_released());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_connected() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let (_id, _mic_tx, mut chunk_rx) = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
        let _commands = remote.open_session();
        wait_for_state(&handle, SessionState::Connected).await;

        // Odd byte count: not decodable as 16-bit PCM
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        remote.send(RemoteEvent::Frame(InboundFrame {
            data: BASE64.encode([1u8, 2, 3]),
            sample_rate: 24000,
        }));

        wait_until(|| handle.counters().decode_errors == 1).await;
        assert_eq!(handle.state(), SessionState::Connected);
        assert!(chunk_rx.try_recv().is_err(), "malformed frame must not be scheduled");
    }

    #[tokio::test]
    async fn test_unexpected_remote_close_tears_down() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let _endpoints = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;
        let _commands = remote.open_session();
        wait_for_state(&handle, SessionState::Connected).await;

        remote.send(RemoteEvent::Closed);
        wait_for_state(&handle, SessionState::Closed).await;

        let (capture, playback) = provider.devices();
        assert!(capture.is_released());
        assert!(playback.is_released());
    }

    #[tokio::test]
    async fn test_late_open_after_stop_is_closed_and_discarded() {
        let provider = Arc::new(TrackingProvider::default());
        let remote = Arc::new(ScriptedRemote::default());
        let _endpoints = provider.inner.install_client(8);

        let handle =
            SessionLifecycleController::spawn(audio_settings(), provider.clone(), remote.clone());

        handle.start();
        wait_for_state(&handle, SessionState::Connecting).await;

        // stop() lands while the remote open is still in flight
        handle.stop();
        wait_for_state(&handle, SessionState::Closed).await;

        // …then the open resolves. The controller must close the session
        // rather than resurrect it.
        let mut commands = remote.open_session();
        wait_until(|| matches!(commands.try_recv(), Ok(TransportCommand::Close))).await;
        assert_eq!(handle.state(), SessionState::Closed);
    }
}
