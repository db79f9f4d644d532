//! # Input Volume Metering
//!
//! Derives an instantaneous loudness scalar (root-mean-square) from each captured
//! block, and provides the single-writer cell the capture loop publishes it
//! through. The visualizer reads the cell on its own redraw cadence; values are
//! overwritten, never queued, and a reader may see a stale or skipped value.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Compute the root-mean-square loudness of a capture block.
///
/// Pure, stateless, O(n). Returns 0.0 for an empty block rather than dividing
/// by zero, and an all-zero block yields exactly 0.0 (never NaN).
pub fn measure(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }

    // Accumulate in f64: summing thousands of f32 squares loses enough
    // precision to visibly bias the result
    let sum_of_squares: f64 = block.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_of_squares / block.len() as f64).sqrt() as f32
}

/// Single-writer, single-reader cell holding the most recent volume sample.
///
/// ## Consistency model:
/// The capture loop stores a fresh value every tick; the visualizer loads it
/// whenever it redraws. "Most recent write wins" is the only guarantee. The f32
/// is stored as its bit pattern in an AtomicU32 so neither side needs a lock.
#[derive(Debug, Clone, Default)]
pub struct VolumeCell {
    bits: Arc<AtomicU32>,
}

impl VolumeCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the current sample (capture loop side).
    pub fn store(&self, volume: f32) {
        self.bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Read the most recent sample (visualizer side).
    pub fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Reset to silence, used on session teardown.
    pub fn clear(&self) {
        self.store(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_empty_block_is_zero() {
        assert_eq!(measure(&[]), 0.0);
    }

    #[test]
    fn test_measure_silence_is_zero_not_nan() {
        let block = vec![0.0f32; 4096];
        let volume = measure(&block);
        assert_eq!(volume, 0.0);
        assert!(!volume.is_nan());
    }

    #[test]
    fn test_measure_constant_block() {
        // RMS of a constant signal is its absolute value
        let block = vec![0.5f32; 1024];
        assert!((measure(&block) - 0.5).abs() < 1e-6);

        let negative = vec![-0.5f32; 1024];
        assert!((measure(&negative) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_measure_square_wave() {
        // Alternating +/-0.8 still has RMS 0.8
        let block: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
        assert!((measure(&block) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_measure_stays_accurate_over_a_large_block() {
        // Accumulation error grows with block length; a full capture tick's
        // worth of samples must still land within tolerance
        let block = vec![0.8f32; 4096];
        assert!((measure(&block) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_volume_cell_last_write_wins() {
        let cell = VolumeCell::new();
        assert_eq!(cell.load(), 0.0);

        cell.store(0.3);
        cell.store(0.7);
        assert_eq!(cell.load(), 0.7);

        cell.clear();
        assert_eq!(cell.load(), 0.0);
    }
}
