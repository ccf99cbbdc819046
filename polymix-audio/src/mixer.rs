//! Master bus processing and drift correction

use crate::effect::Effect;
use crate::state::distance;
use std::time::Duration;

/// Master processor chain: custom effect, then smoothed volume, then clamp
pub struct MasterBus {
    /// Master volume
    volume: f32,
    /// Smoothed master volume (interpolates toward volume to prevent clicks)
    smoothed_volume: f32,
    effect: Option<Box<dyn Effect>>,
}

impl MasterBus {
    /// Smoothing coefficient for master volume (~5ms at 48kHz)
    const VOLUME_SMOOTH_COEFF: f32 = 0.995;
}

impl Default for MasterBus {
    fn default() -> Self {
        Self {
            volume: 1.0,
            smoothed_volume: 1.0,
            effect: None,
        }
    }
}

impl MasterBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set master volume (0.0 to 2.0)
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 2.0);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_effect(&mut self, effect: Option<Box<dyn Effect>>) {
        self.effect = effect;
    }

    /// Jump the smoothed volume to its target and reset the effect
    pub fn reset(&mut self) {
        self.smoothed_volume = self.volume;
        if let Some(effect) = self.effect.as_mut() {
            effect.reset();
        }
    }

    /// Process one interleaved master block in place
    pub fn process(&mut self, samples: &mut [f32], channels: u16) {
        if let Some(effect) = self.effect.as_mut() {
            effect.process(samples, channels);
        }

        let channels = channels.max(1) as usize;
        if self.smoothed_volume == self.volume {
            if self.volume != 1.0 {
                for s in samples.iter_mut() {
                    *s *= self.volume;
                }
            }
        } else {
            for frame in samples.chunks_mut(channels) {
                self.smoothed_volume = Self::VOLUME_SMOOTH_COEFF * self.smoothed_volume
                    + (1.0 - Self::VOLUME_SMOOTH_COEFF) * self.volume;
                for s in frame.iter_mut() {
                    *s *= self.smoothed_volume;
                }
            }
            if (self.smoothed_volume - self.volume).abs() < 1e-4 {
                self.smoothed_volume = self.volume;
            }
        }

        for s in samples.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

/// Indices of the sources to re-seek to `mixed`.
///
/// Nothing is corrected unless the positions spread by more than `spread`;
/// then every source further than `resync` from the mixed position is
/// pulled back.
pub fn drift_targets(
    positions: &[Duration],
    mixed: Duration,
    spread: Duration,
    resync: Duration,
) -> Vec<usize> {
    if positions.len() < 2 {
        return Vec::new();
    }
    let min = positions.iter().min().copied().unwrap_or_default();
    let max = positions.iter().max().copied().unwrap_or_default();
    if max - min <= spread {
        return Vec::new();
    }
    positions
        .iter()
        .enumerate()
        .filter(|(_, &p)| distance(p, mixed) > resync)
        .map(|(i, _)| i)
        .collect()
}
