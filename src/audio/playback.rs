//! # Gapless Playback Scheduling
//!
//! Owns the monotonically advancing "next free playback slot" cursor and places
//! decoded chunks back-to-back on the output device: no gap when chunks arrive
//! faster than real time, no overlap when two chunks are scheduled in a row.
//!
//! ## The defining invariant:
//! For chunks scheduled in order, `start(C2) >= start(C1) + duration(C1)`, and
//! `start(C2) <= start(C1) + duration(C1) + max(0, arrival gap)`. A chunk never
//! starts before its predecessor finishes, and the scheduler never inserts
//! silence once chunks are queued.

use crate::audio::codec::DecodedChunk;
use crate::device::PlaybackDevice;
use tracing::trace;

/// Schedules decoded chunks onto the playback device in strict arrival order.
///
/// This is the only component permitted to mutate playback hardware state. The
/// cursor is mutated exactly once per scheduled chunk:
/// `cursor = max(current_clock, cursor) + chunk.duration`.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    /// Earliest clock time the next chunk may begin playing at
    cursor: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor value (the next free playback slot).
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Schedule one chunk and advance the cursor. Returns the start time the
    /// chunk was placed at.
    ///
    /// `current_clock` must be a fresh reading of the playback device clock;
    /// taking it as a parameter keeps the placement law deterministic and
    /// testable.
    pub fn schedule_next(
        &mut self,
        chunk: DecodedChunk,
        current_clock: f64,
        device: &PlaybackDevice,
    ) -> f64 {
        let start = current_clock.max(self.cursor);
        let duration = chunk.duration;

        device.play_at(chunk, start);
        self.cursor = start + duration;

        trace!(start, duration, cursor = self.cursor, "scheduled playback chunk");
        start
    }

    /// Re-seat the cursor at the current clock, called on session teardown so a
    /// subsequent session starts cleanly.
    pub fn reset(&mut self, current_clock: f64) {
        self.cursor = current_clock;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ScheduledChunk;
    use tokio::sync::mpsc;

    fn chunk(duration: f64) -> DecodedChunk {
        let samples = (duration * 24000.0).round() as usize;
        DecodedChunk {
            samples: vec![0.0; samples],
            sample_rate: 24000,
            duration,
        }
    }

    fn sink() -> (PlaybackDevice, mpsc::UnboundedReceiver<ScheduledChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PlaybackDevice::new(24000, tx), rx)
    }

    #[test]
    fn test_back_to_back_chunks_have_no_gap_or_overlap() {
        let (device, mut rx) = sink();
        let mut scheduler = PlaybackScheduler::new();

        // C1 at clock 1.0, C2 arrives while C1 is still playing
        let s1 = scheduler.schedule_next(chunk(0.5), 1.0, &device);
        let s2 = scheduler.schedule_next(chunk(0.25), 1.1, &device);

        assert_eq!(s1, 1.0);
        assert_eq!(s2, 1.5); // exactly C1's end, no silence inserted
        assert_eq!(scheduler.cursor(), 1.75);

        let placed1 = rx.try_recv().unwrap();
        let placed2 = rx.try_recv().unwrap();
        assert_eq!(placed1.start, 1.0);
        assert_eq!(placed2.start, 1.5);
    }

    #[test]
    fn test_late_chunk_starts_at_current_clock() {
        let (device, _rx) = sink();
        let mut scheduler = PlaybackScheduler::new();

        let s1 = scheduler.schedule_next(chunk(0.5), 1.0, &device);
        assert_eq!(s1, 1.0);

        // C2 arrives at clock 3.0, well after C1 finished at 1.5
        let s2 = scheduler.schedule_next(chunk(0.5), 3.0, &device);
        assert_eq!(s2, 3.0); // no needless delay
        assert_eq!(scheduler.cursor(), 3.5);
    }

    #[test]
    fn test_ordering_invariant_over_a_burst() {
        let (device, _rx) = sink();
        let mut scheduler = PlaybackScheduler::new();

        // Five chunks delivered in one burst at clock 2.0
        let durations = [0.3, 0.1, 0.25, 0.05, 0.4];
        let mut previous_end: Option<f64> = None;
        for d in durations {
            let start = scheduler.schedule_next(chunk(d), 2.0, &device);
            if let Some(end) = previous_end {
                assert!((start - end).abs() < 1e-9, "gap or overlap at {}", start);
            }
            previous_end = Some(start + d);
        }
    }

    #[test]
    fn test_reset_reseats_cursor_at_clock() {
        let (device, _rx) = sink();
        let mut scheduler = PlaybackScheduler::new();

        scheduler.schedule_next(chunk(2.0), 0.0, &device);
        assert_eq!(scheduler.cursor(), 2.0);

        scheduler.reset(0.5);
        assert_eq!(scheduler.cursor(), 0.5);

        // Next chunk schedules from the fresh cursor
        let start = scheduler.schedule_next(chunk(0.5), 0.5, &device);
        assert_eq!(start, 0.5);
    }
}
