//! RMS level metering over raw little-endian f32 PCM

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Floor of the meter scale
pub const FLOOR_DB: f64 = -60.0;
/// Ceiling of the meter scale
pub const CEIL_DB: f64 = 0.0;

const SAMPLE_BYTES: usize = 4;

/// `20*log10(rms)` clamped to the meter scale. Silence, negative and NaN
/// input all read as the floor.
pub fn db_from_rms(rms: f64) -> f64 {
    if rms.is_nan() || rms <= 0.0 {
        return FLOOR_DB;
    }
    (20.0 * rms.log10()).clamp(FLOOR_DB, CEIL_DB)
}

/// Linear level for a dB value on the meter scale
pub fn level_from_db(db: f64) -> f64 {
    let db = if db.is_nan() { FLOOR_DB } else { db.clamp(FLOOR_DB, CEIL_DB) };
    10f64.powf(db / 20.0)
}

/// Splits a byte stream into whole f32 samples, carrying partial trailing
/// bytes over to the next chunk
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    remainder: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of squares and count of the complete samples now available
    pub fn push(&mut self, chunk: &[u8]) -> (f64, usize) {
        let mut buffer = std::mem::take(&mut self.remainder);
        buffer.extend_from_slice(chunk);

        let usable = buffer.len() - buffer.len() % SAMPLE_BYTES;
        let mut sum_squares = 0.0f64;
        let mut count = 0usize;
        for bytes in buffer[..usable].chunks_exact(SAMPLE_BYTES) {
            let sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
            if sample.is_finite() {
                sum_squares += sample * sample;
            }
            count += 1;
        }

        self.remainder = buffer[usable..].to_vec();
        (sum_squares, count)
    }

    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    pub fn clear(&mut self) {
        self.remainder.clear();
    }
}

/// One channel's level
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelReading {
    /// Linear level, 0..1
    pub level: f64,
    /// Clamped dB value
    pub db: f64,
    pub peak_db: f64,
    #[serde(skip)]
    pub peak_at: Option<Instant>,
}

impl LevelReading {
    pub fn floor() -> Self {
        Self {
            level: 0.0,
            db: FLOOR_DB,
            peak_db: FLOOR_DB,
            peak_at: None,
        }
    }

    pub fn from_rms(rms: f64) -> Self {
        let db = db_from_rms(rms);
        Self {
            level: level_from_db(db),
            db,
            peak_db: db,
            peak_at: None,
        }
    }
}

impl Default for LevelReading {
    fn default() -> Self {
        Self::floor()
    }
}

/// Running meter for one capture stream, with peak hold
#[derive(Debug)]
pub struct ChannelMeter {
    accumulator: FrameAccumulator,
    reading: LevelReading,
    peak_hold: Duration,
}

impl ChannelMeter {
    pub fn new(peak_hold: Duration) -> Self {
        Self {
            accumulator: FrameAccumulator::new(),
            reading: LevelReading::floor(),
            peak_hold,
        }
    }

    /// Update from one read of the capture stream
    pub fn feed(&mut self, chunk: &[u8]) -> LevelReading {
        let (sum_squares, count) = self.accumulator.push(chunk);
        let mut next = if count == 0 {
            LevelReading::floor()
        } else {
            LevelReading::from_rms((sum_squares / count as f64).sqrt())
        };

        let now = Instant::now();
        let held = self
            .reading
            .peak_at
            .map(|at| now.saturating_duration_since(at) < self.peak_hold)
            .unwrap_or(false);
        if held && self.reading.peak_db > next.db {
            next.peak_db = self.reading.peak_db;
            next.peak_at = self.reading.peak_at;
        } else {
            next.peak_db = next.db;
            next.peak_at = Some(now);
        }

        self.reading = next;
        next
    }

    pub fn reading(&self) -> LevelReading {
        self.reading
    }

    /// Back to the floor, dropping any partial sample
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.reading = LevelReading::floor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pcm(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_silence_is_exactly_floor() {
        assert_eq!(db_from_rms(0.0), -60.0);
        assert_eq!(db_from_rms(f64::NEG_INFINITY), -60.0);
        assert_eq!(db_from_rms(f64::NAN), -60.0);
        let reading = LevelReading::from_rms(0.0);
        assert_eq!(reading.db, -60.0);
        assert!((reading.level - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_full_scale_is_zero_db() {
        assert_eq!(db_from_rms(1.0), 0.0);
        assert_eq!(db_from_rms(4.0), 0.0);
        assert_eq!(level_from_db(0.0), 1.0);
    }

    proptest! {
        #[test]
        fn level_is_clamped(rms in prop::num::f64::ANY) {
            let reading = LevelReading::from_rms(rms);
            prop_assert!((FLOOR_DB..=CEIL_DB).contains(&reading.db));
            prop_assert!((0.0..=1.0).contains(&reading.level));
        }
    }

    #[test]
    fn test_partial_samples_carry_over() {
        let mut acc = FrameAccumulator::new();
        let bytes = pcm(&[0.5, 0.5]);

        let (_, count) = acc.push(&bytes[..6]);
        assert_eq!(count, 1);
        assert_eq!(acc.pending(), 2);

        let (sum, count) = acc.push(&bytes[6..]);
        assert_eq!(count, 1);
        assert!((sum - 0.25).abs() < 1e-9);
        assert_eq!(acc.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_holds_peak() {
        let mut meter = ChannelMeter::new(Duration::from_secs(1));
        let loud = meter.feed(&pcm(&[0.5, -0.5, 0.5, -0.5]));
        assert!((loud.db - 20.0 * 0.5f64.log10()).abs() < 1e-6);

        tokio::time::advance(Duration::from_millis(200)).await;
        let quiet = meter.feed(&pcm(&[0.01, -0.01]));
        assert!(quiet.db < loud.db);
        assert_eq!(quiet.peak_db, loud.db);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let later = meter.feed(&pcm(&[0.01, -0.01]));
        assert_eq!(later.peak_db, later.db);
    }

    #[test]
    fn test_chunk_without_whole_sample_reads_floor() {
        let mut meter = ChannelMeter::new(Duration::from_secs(1));
        let reading = meter.feed(&[0u8, 1]);
        assert_eq!(reading.db, FLOOR_DB);
        meter.reset();
        assert_eq!(meter.reading(), LevelReading::floor());
    }
}
