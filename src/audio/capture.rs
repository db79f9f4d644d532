//! # Audio Capture Loop
//!
//! The continuous background process of a connected consultation: every tick it
//! pulls one fixed-size block of microphone samples, publishes a volume sample
//! for the visualizer, encodes the block into a transport frame, and hands the
//! frame to the remote session's send path.
//!
//! ## Tick size:
//! 4096 samples at 16 kHz by default, about 256 ms per tick. Smaller blocks cut
//! latency but multiply per-tick overhead and frame count.
//!
//! ## Failure policy:
//! Streaming is best-effort, not guaranteed delivery. A send failure costs that
//! one frame; it is logged and capture of subsequent blocks continues.

use crate::audio::codec;
use crate::audio::volume::{self, VolumeCell};
use crate::device::CaptureDevice;
use crate::remote::RemoteHandle;
use crate::session::SessionCounters;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running capture loop.
///
/// Ticks are strictly sequential: tick N's frame is enqueued for send before
/// tick N+1's block is read, so outbound frames leave in capture order.
pub struct AudioCaptureLoop {
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AudioCaptureLoop {
    /// Start capturing from `device` in a background task.
    pub fn spawn(
        device: Arc<CaptureDevice>,
        remote: RemoteHandle,
        volume_cell: VolumeCell,
        block_size: usize,
        counters: Arc<SessionCounters>,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));

        let task = {
            let stopped = stopped.clone();
            tokio::spawn(async move {
                while !stopped.load(Ordering::SeqCst) {
                    let Some(block) = device.read_block(block_size).await else {
                        debug!("capture feed ended, stopping capture loop");
                        break;
                    };

                    // stop() may have raced the read; this tick must not fire
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }

                    volume_cell.store(volume::measure(&block));

                    let frame = codec::encode_block(&block, device.sample_rate());
                    match remote.send(frame) {
                        Ok(()) => counters.record_frame_sent(),
                        Err(err) => {
                            // Best-effort: skip this frame, keep capturing
                            warn!("dropping outbound frame: {}", err);
                            counters.record_frame_dropped();
                        }
                    }
                }

                volume_cell.clear();
            })
        };

        Self { stopped, task }
    }

    /// Detach from the device: no tick fires after this returns. Idempotent,
    /// safe to call when already stopped.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("capture loop stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the background task has fully wound down.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{decode_frame, InboundFrame};
    use crate::remote::TransportCommand;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Duration};

    const BLOCK: usize = 4096;

    fn capture_device(blocks: Vec<Vec<f32>>) -> Arc<CaptureDevice> {
        let (tx, rx) = mpsc::channel(blocks.len().max(1));
        for block in blocks {
            tx.try_send(block).unwrap();
        }
        // Dropping the sender ends the feed after the queued blocks
        Arc::new(CaptureDevice::new(16000, rx))
    }

    async fn collect_frames(
        rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
        count: usize,
    ) -> Vec<crate::audio::codec::OutboundFrame> {
        let mut frames = Vec::new();
        while frames.len() < count {
            let command = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame did not arrive")
                .expect("transport channel closed");
            if let TransportCommand::Frame(frame) = command {
                frames.push(frame);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_three_ticks_send_three_frames_in_order() {
        // Keep the mic sender alive for the whole test. Dropping it early
        // would let the loop finish and clear the volume cell before the
        // final assertions run.
        let (mic_tx, rx) = mpsc::channel(4);
        let device = Arc::new(CaptureDevice::new(16000, rx));
        for block in [vec![0.1f32; BLOCK], vec![0.2f32; BLOCK], vec![0.3f32; BLOCK]] {
            mic_tx.try_send(block).unwrap();
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let remote = RemoteHandle::new(command_tx);
        let volume_cell = VolumeCell::new();
        let counters = Arc::new(SessionCounters::default());

        let _loop = AudioCaptureLoop::spawn(
            device,
            remote,
            volume_cell.clone(),
            BLOCK,
            counters.clone(),
        );

        let frames = collect_frames(&mut command_rx, 3).await;

        // Arrival order matches capture order; verify via the decoded amplitude
        for (frame, expected) in frames.iter().zip([0.1f32, 0.2, 0.3]) {
            assert_eq!(frame.sample_rate, 16000);
            let chunk = decode_frame(&InboundFrame {
                data: frame.data.clone(),
                sample_rate: frame.sample_rate,
            })
            .unwrap();
            assert!((chunk.samples[0] - expected).abs() < 0.001);
        }

        assert_eq!(counters.snapshot().frames_sent, 3);
        // Volume was published for the final tick (RMS of constant 0.3)
        assert!((volume_cell.load() - 0.3).abs() < 0.001);

        // Now end the feed so the loop exits
        drop(mic_tx);
    }

    #[tokio::test]
    async fn test_send_failure_skips_frame_and_continues() {
        let blocks = vec![vec![0.1f32; BLOCK], vec![0.2f32; BLOCK]];
        let device = capture_device(blocks);

        // Receiver dropped up front: every send fails
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        drop(command_rx);
        let remote = RemoteHandle::new(command_tx);
        let counters = Arc::new(SessionCounters::default());

        let capture = AudioCaptureLoop::spawn(
            device,
            remote,
            VolumeCell::new(),
            BLOCK,
            counters.clone(),
        );

        // The loop drains both blocks despite the failures, then ends
        timeout(Duration::from_secs(1), async {
            while !capture.is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("capture loop did not finish");

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.frames_sent, 0);
        assert_eq!(snapshot.frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_halts_ticks() {
        let (tx, rx) = mpsc::channel(4);
        let device = Arc::new(CaptureDevice::new(16000, rx));

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let remote = RemoteHandle::new(command_tx);
        let counters = Arc::new(SessionCounters::default());

        let capture = AudioCaptureLoop::spawn(
            device.clone(),
            remote,
            VolumeCell::new(),
            BLOCK,
            counters,
        );

        capture.stop();
        capture.stop(); // safe when already stopped
        assert!(capture.is_stopped());

        // A block arriving after stop must not produce a frame
        tx.send(vec![0.5f32; BLOCK]).await.unwrap();
        device.release();

        timeout(Duration::from_secs(1), async {
            while !capture.is_finished() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("capture loop did not finish");

        assert!(command_rx.try_recv().is_err());
    }
}
