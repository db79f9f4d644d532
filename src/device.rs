//! # Audio Device Acquisition
//!
//! The device-acquisition collaborator for the live consultation. A controller
//! acquires two independent device contexts at session start, a capture context
//! at the capture rate and a playback context at the playback rate, and owns
//! them exclusively until teardown releases them.
//!
//! Devices here are channel-backed: the connected client bridge (WebSocket actor)
//! feeds microphone PCM into the capture side and drains scheduled chunks from
//! the playback side. Tests wire the same endpoints directly.
//!
//! ## Release semantics:
//! `release()` is idempotent and unconditionally safe: releasing a context that
//! was never fed, or releasing twice, is a no-op. Teardown paths rely on this.

use crate::audio::codec::{CaptureBlock, DecodedChunk};
use crate::error::ConsultError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// A decoded chunk paired with the clock time it must begin playing at.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledChunk {
    pub chunk: DecodedChunk,
    pub start: f64,
}

/// Hands out device contexts to a session controller.
///
/// Each acquisition transfers exclusive ownership of the underlying feed to the
/// caller; a second acquisition without a fresh client installation fails.
pub trait DeviceProvider: Send + Sync {
    fn acquire_capture(&self, sample_rate: u32) -> Result<Arc<CaptureDevice>, ConsultError>;
    fn acquire_playback(&self, sample_rate: u32) -> Result<Arc<PlaybackDevice>, ConsultError>;
}

/// Inner capture state: the raw feed plus samples left over from re-blocking.
struct CaptureFeed {
    rx: mpsc::Receiver<Vec<f32>>,
    pending: Vec<f32>,
}

/// The capture device context.
///
/// Incoming PCM arrives in arbitrarily sized batches from the client; the
/// context re-blocks them into the fixed tick size the capture loop asks for.
/// Only the capture loop reads from it while the session owns it.
pub struct CaptureDevice {
    sample_rate: u32,
    feed: Mutex<CaptureFeed>,
    released: AtomicBool,
    released_notify: Notify,
}

impl CaptureDevice {
    pub fn new(sample_rate: u32, rx: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            feed: Mutex::new(CaptureFeed {
                rx,
                pending: Vec::new(),
            }),
            released: AtomicBool::new(false),
            released_notify: Notify::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Pull the next fixed-size block of samples.
    ///
    /// Waits until `frames` samples have accumulated. Returns `None` once the
    /// context is released or the client feed has gone away; the capture loop
    /// treats that as end of capture.
    pub async fn read_block(&self, frames: usize) -> Option<CaptureBlock> {
        if self.is_released() || frames == 0 {
            return None;
        }

        let mut feed = self.feed.lock().await;
        loop {
            if self.is_released() {
                return None;
            }

            if feed.pending.len() >= frames {
                let block: CaptureBlock = feed.pending.drain(..frames).collect();
                return Some(block);
            }

            // Register for the release wakeup before the select, so a release
            // landing between the flag check above and the await cannot be a
            // lost wakeup
            let released = self.released_notify.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.is_released() {
                return None;
            }

            tokio::select! {
                incoming = feed.rx.recv() => match incoming {
                    Some(samples) => feed.pending.extend(samples),
                    None => return None,
                },
                _ = &mut released => return None,
            }
        }
    }

    /// Release the context. Idempotent; wakes any in-flight `read_block`.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.released_notify.notify_waiters();
            debug!("capture device context released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// The playback device context.
///
/// Exposes the device clock (seconds since the context opened) and accepts
/// chunks scheduled at absolute clock times. The playback scheduler is the only
/// component that writes to it.
pub struct PlaybackDevice {
    sample_rate: u32,
    sink: mpsc::UnboundedSender<ScheduledChunk>,
    opened_at: Instant,
    released: AtomicBool,
}

impl PlaybackDevice {
    pub fn new(sample_rate: u32, sink: mpsc::UnboundedSender<ScheduledChunk>) -> Self {
        Self {
            sample_rate,
            sink,
            opened_at: Instant::now(),
            released: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current playback clock reading, in seconds since the context opened.
    /// Monotonically non-decreasing; still readable after release so teardown
    /// can reset the scheduler cursor.
    pub fn clock(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    /// Emit a chunk to the output at the given start time.
    ///
    /// Best-effort: a released context or a gone sink costs the chunk, nothing
    /// else.
    pub fn play_at(&self, chunk: DecodedChunk, start: f64) {
        if self.is_released() {
            debug!("playback device released, dropping chunk");
            return;
        }

        if self.sink.send(ScheduledChunk { chunk, start }).is_err() {
            debug!("playback sink closed, dropping chunk");
        }
    }

    /// Release the context. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("playback device context released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Channel-backed provider bridging the connected client to device contexts.
///
/// The WebSocket bridge installs one pair of endpoints per client; a session
/// start then takes them over. Acquiring when no client endpoints are installed
/// is a device error (microphone/speaker unavailable).
#[derive(Default)]
pub struct ChannelDeviceProvider {
    capture_slot: StdMutex<Option<mpsc::Receiver<Vec<f32>>>>,
    playback_slot: StdMutex<Option<mpsc::UnboundedSender<ScheduledChunk>>>,
    /// Client id of the current installation, 0 when none is installed.
    owner: AtomicU64,
    next_client: AtomicU64,
}

impl ChannelDeviceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install fresh endpoints for a connected client.
    ///
    /// Returns the id tagging this installation, the sender the bridge pushes
    /// microphone samples into and the receiver it drains scheduled playback
    /// chunks from. Replaces any previous installation and transfers ownership
    /// to the new client.
    pub fn install_client(
        &self,
        capture_capacity: usize,
    ) -> (
        u64,
        mpsc::Sender<Vec<f32>>,
        mpsc::UnboundedReceiver<ScheduledChunk>,
    ) {
        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (capture_tx, capture_rx) = mpsc::channel(capture_capacity.max(1));
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        *self.capture_slot.lock().unwrap() = Some(capture_rx);
        *self.playback_slot.lock().unwrap() = Some(playback_tx);
        self.owner.store(client_id, Ordering::SeqCst);

        (client_id, capture_tx, playback_rx)
    }

    /// Drop the installed endpoints if `owner` still holds them.
    ///
    /// Returns whether the caller owned the installation. A disconnect racing
    /// a newer client's installation comes back `false` and must leave the
    /// session alone.
    pub fn clear_client(&self, owner: u64) -> bool {
        if self
            .owner
            .compare_exchange(owner, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.capture_slot.lock().unwrap().take();
        self.playback_slot.lock().unwrap().take();
        true
    }
}

impl DeviceProvider for ChannelDeviceProvider {
    fn acquire_capture(&self, sample_rate: u32) -> Result<Arc<CaptureDevice>, ConsultError> {
        let rx = self
            .capture_slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ConsultError::Device("no microphone feed available".to_string()))?;

        Ok(Arc::new(CaptureDevice::new(sample_rate, rx)))
    }

    fn acquire_playback(&self, sample_rate: u32) -> Result<Arc<PlaybackDevice>, ConsultError> {
        let sink = self
            .playback_slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ConsultError::Device("no playback sink available".to_string()))?;

        Ok(Arc::new(PlaybackDevice::new(sample_rate, sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_reblocks_into_fixed_ticks() {
        let (tx, rx) = mpsc::channel(8);
        let device = CaptureDevice::new(16000, rx);

        // Two uneven batches that together cover one 4096-sample block
        tx.send(vec![0.1f32; 3000]).await.unwrap();
        tx.send(vec![0.2f32; 2000]).await.unwrap();

        let block = device.read_block(4096).await.unwrap();
        assert_eq!(block.len(), 4096);
        assert_eq!(block[0], 0.1);
        assert_eq!(block[4095], 0.2);

        // 904 samples remain pending; top them up for a second block
        tx.send(vec![0.3f32; 3500]).await.unwrap();
        let block = device.read_block(4096).await.unwrap();
        assert_eq!(block.len(), 4096);
    }

    #[tokio::test]
    async fn test_capture_read_after_release_is_none() {
        let (tx, rx) = mpsc::channel(8);
        let device = CaptureDevice::new(16000, rx);
        tx.send(vec![0.0f32; 8192]).await.unwrap();

        device.release();
        assert!(device.read_block(4096).await.is_none());

        // Releasing again is a no-op
        device.release();
        assert!(device.is_released());
    }

    #[tokio::test]
    async fn test_capture_release_wakes_blocked_reader() {
        let (_tx, rx) = mpsc::channel::<Vec<f32>>(8);
        let device = Arc::new(CaptureDevice::new(16000, rx));

        let reader = {
            let device = device.clone();
            tokio::spawn(async move { device.read_block(4096).await })
        };

        tokio::task::yield_now().await;
        device.release();

        assert!(reader.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_feed_closed_ends_reads() {
        let (tx, rx) = mpsc::channel(8);
        let device = CaptureDevice::new(16000, rx);
        drop(tx);

        assert!(device.read_block(4096).await.is_none());
    }

    #[tokio::test]
    async fn test_playback_clock_is_monotonic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let device = PlaybackDevice::new(24000, tx);

        let first = device.clock();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = device.clock();
        assert!(second >= first);
    }

    #[test]
    fn test_playback_release_drops_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let device = PlaybackDevice::new(24000, tx);
        let chunk = DecodedChunk {
            samples: vec![0.0; 240],
            sample_rate: 24000,
            duration: 0.01,
        };

        device.play_at(chunk.clone(), 0.0);
        assert!(rx.try_recv().is_ok());

        device.release();
        device.release();
        device.play_at(chunk, 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_provider_requires_installed_client() {
        let provider = ChannelDeviceProvider::new();
        assert!(provider.acquire_capture(16000).is_err());
        assert!(provider.acquire_playback(24000).is_err());

        let (_id, _mic_tx, _chunk_rx) = provider.install_client(32);
        assert!(provider.acquire_capture(16000).is_ok());
        assert!(provider.acquire_playback(24000).is_ok());

        // Endpoints were taken; a second acquisition needs a new installation
        assert!(provider.acquire_capture(16000).is_err());
    }

    #[test]
    fn test_provider_clear_client_removes_endpoints() {
        let provider = ChannelDeviceProvider::new();
        let (id, _mic_tx, _chunk_rx) = provider.install_client(32);
        assert!(provider.clear_client(id));
        assert!(provider.acquire_capture(16000).is_err());
    }

    #[test]
    fn test_clear_client_requires_current_owner() {
        let provider = ChannelDeviceProvider::new();
        let (first_id, _first_mic, _first_chunks) = provider.install_client(32);

        // A second client connects and installs fresh endpoints before the
        // first client's disconnect lands
        let (second_id, _second_mic, _second_chunks) = provider.install_client(32);
        assert_ne!(first_id, second_id);

        // The stale disconnect must not disturb the newer installation
        assert!(!provider.clear_client(first_id));
        assert!(provider.acquire_capture(16000).is_ok());

        assert!(provider.clear_client(second_id));
        assert!(provider.acquire_playback(24000).is_err());
    }

    #[tokio::test]
    async fn test_release_during_partial_block_wakes_reader() {
        let (tx, rx) = mpsc::channel(4);
        let device = Arc::new(CaptureDevice::new(16000, rx));

        // Not enough samples for a full block, so the reader parks on the feed
        tx.send(vec![0.5; 100]).await.unwrap();

        let reader = {
            let device = device.clone();
            tokio::spawn(async move { device.read_block(4096).await })
        };
        tokio::task::yield_now().await;

        device.release();
        let block = reader.await.unwrap();
        assert!(block.is_none());
    }
}
