//! Peak and RMS level metering

use crate::buffers::mix;

/// How long a new peak is held before it starts to decay
const HOLD_SECONDS: f32 = 1.0;
/// Per-block decay of the held peak once the hold expires
const DECAY_RATE: f32 = 0.995;
/// Anything above this counts as clipping
const CLIP_LEVEL: f32 = 0.99;

/// Point-in-time meter readings
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelSnapshot {
    /// Smoothed peak level (0.0-1.0)
    pub peak: f32,
    /// Held peak (decays slowly after the hold time)
    pub peak_hold: f32,
    pub rms: f32,
    pub clipping: bool,
}

/// Level meter fed one interleaved block at a time
#[derive(Debug)]
pub struct LevelMeter {
    /// Frames per hold period at the metered sample rate
    hold_frames: u32,
    peak: f32,
    peak_hold: f32,
    hold_remaining: u32,
    rms: f32,
    clipping: bool,
}

impl LevelMeter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            hold_frames: (sample_rate as f32 * HOLD_SECONDS) as u32,
            peak: 0.0,
            peak_hold: 0.0,
            hold_remaining: 0,
            rms: 0.0,
            clipping: false,
        }
    }

    pub fn process(&mut self, samples: &[f32], channels: u16) {
        let current_peak = mix::peak(samples);

        self.peak = self.peak * 0.95 + current_peak * 0.05;
        self.rms = mix::rms(samples);
        self.clipping = current_peak > CLIP_LEVEL;

        let frames = (samples.len() / channels.max(1) as usize) as u32;
        if current_peak > self.peak_hold {
            self.peak_hold = current_peak;
            self.hold_remaining = self.hold_frames;
        } else if self.hold_remaining > 0 {
            self.hold_remaining = self.hold_remaining.saturating_sub(frames);
        } else {
            self.peak_hold *= DECAY_RATE;
        }
    }

    pub fn snapshot(&self) -> LevelSnapshot {
        LevelSnapshot {
            peak: self.peak,
            peak_hold: self.peak_hold,
            rms: self.rms,
            clipping: self.clipping,
        }
    }

    pub fn reset(&mut self) {
        *self = Self {
            hold_frames: self.hold_frames,
            ..Self::new(0)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_smoothing_and_hold() {
        let mut meter = LevelMeter::new(44100);
        meter.process(&[0.5, -0.5, 0.5, -0.5], 2);

        let snap = meter.snapshot();
        assert!((snap.peak - 0.025).abs() < 1e-6);
        assert_eq!(snap.peak_hold, 0.5);
        assert!((snap.rms - 0.5).abs() < 1e-6);
        assert!(!snap.clipping);

        // Quieter block keeps the hold
        meter.process(&[0.1; 4], 2);
        assert_eq!(meter.snapshot().peak_hold, 0.5);
    }

    #[test]
    fn test_clipping_flag() {
        let mut meter = LevelMeter::new(44100);
        meter.process(&[1.0, 0.0], 2);
        assert!(meter.snapshot().clipping);
        meter.process(&[0.2, 0.0], 2);
        assert!(!meter.snapshot().clipping);
    }

    #[test]
    fn test_hold_decays_after_expiry() {
        let mut meter = LevelMeter::new(44100);
        meter.process(&[0.8], 1);
        let block = vec![0.0; 44100];
        meter.process(&block, 1);
        meter.process(&block, 1);
        assert!(meter.snapshot().peak_hold < 0.8);
    }

    #[test]
    fn test_hold_time_follows_sample_rate() {
        // One second of stereo at 8 kHz is 8000 frames
        let mut meter = LevelMeter::new(8000);
        meter.process(&[0.8, 0.8], 2);
        meter.process(&vec![0.0; 2 * 7990], 2);
        meter.process(&[0.0, 0.0], 2);
        assert_eq!(meter.snapshot().peak_hold, 0.8);

        meter.process(&vec![0.0; 2 * 10], 2);
        meter.process(&[0.0, 0.0], 2);
        assert!(meter.snapshot().peak_hold < 0.8);
    }

    #[test]
    fn test_reset_keeps_hold_time() {
        let mut meter = LevelMeter::new(8000);
        meter.process(&[1.0], 1);
        meter.reset();
        assert_eq!(meter.snapshot(), LevelSnapshot::default());

        meter.process(&[0.5], 1);
        meter.process(&vec![0.0; 4000], 1);
        assert_eq!(meter.snapshot().peak_hold, 0.5);
    }
}
