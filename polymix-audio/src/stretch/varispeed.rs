//! Varispeed time-stretcher backed by rubato
//!
//! Tempo and pitch are folded into a single playback rate
//! `(1 + tempo/100) * 2^(pitch/12)` and applied by resampling, so the two
//! are coupled: raising the pitch also shortens the output. Swap in a phase
//! vocoder through [`super::StretchFactory`] for independent control.

use super::{TimeStretch, PITCH_RANGE, TEMPO_RANGE};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;
use tracing::warn;

/// Input frames per resampler call
const CHUNK_FRAMES: usize = 1024;
/// Maximum rate deviation in either direction
const MAX_RATE: f64 = 4.0;

/// Resampling time-stretcher
pub struct VarispeedStretcher {
    sample_rate: u32,
    channels: usize,
    tempo: f32,
    pitch: f32,
    resampler: Option<FastFixedIn<f32>>,
    /// Deinterleaved input waiting for a full chunk
    pending: Vec<Vec<f32>>,
    /// Interleaved processed output
    output: VecDeque<f32>,
}

impl VarispeedStretcher {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let mut stretcher = Self {
            sample_rate,
            channels,
            tempo: 0.0,
            pitch: 0.0,
            resampler: None,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels],
            output: VecDeque::with_capacity(CHUNK_FRAMES * channels * 4),
        };
        stretcher.resampler = stretcher.build_resampler();
        stretcher
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Combined playback rate (1.0 = unchanged)
    pub fn playback_rate(&self) -> f64 {
        let tempo = 1.0 + self.tempo as f64 / 100.0;
        let pitch = 2f64.powf(self.pitch as f64 / 12.0);
        (tempo * pitch).clamp(1.0 / MAX_RATE, MAX_RATE)
    }

    fn build_resampler(&self) -> Option<FastFixedIn<f32>> {
        let mut resampler = match FastFixedIn::<f32>::new(
            1.0,
            MAX_RATE,
            PolynomialDegree::Cubic,
            CHUNK_FRAMES,
            self.channels,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!("Varispeed resampler unavailable, passing audio through: {}", e);
                return None;
            }
        };
        if let Err(e) = resampler.set_resample_ratio(1.0 / self.playback_rate(), false) {
            warn!("Failed to set varispeed ratio: {}", e);
        }
        Some(resampler)
    }

    fn update_ratio(&mut self) {
        let ratio = 1.0 / self.playback_rate();
        if let Some(resampler) = self.resampler.as_mut() {
            if let Err(e) = resampler.set_resample_ratio(ratio, false) {
                warn!("Failed to set varispeed ratio {:.3}: {}", ratio, e);
            }
        }
    }

    fn push_interleaved(&mut self, channels: &[Vec<f32>], frames: usize) {
        for f in 0..frames {
            for ch in channels {
                self.output.push_back(ch.get(f).copied().unwrap_or(0.0));
            }
        }
    }

    /// Run every complete chunk of pending input through the resampler
    fn process_pending(&mut self) {
        loop {
            let Some(resampler) = self.resampler.as_mut() else {
                // Passthrough
                let frames = self.pending[0].len();
                let pending = std::mem::take(&mut self.pending);
                self.push_interleaved(&pending, frames);
                self.pending = pending;
                self.pending.iter_mut().for_each(Vec::clear);
                return;
            };

            let needed = resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return;
            }

            let input: Vec<&[f32]> = self.pending.iter().map(|c| &c[..needed]).collect();
            match resampler.process(&input, None) {
                Ok(out) => {
                    let frames = out.first().map(Vec::len).unwrap_or(0);
                    self.push_interleaved(&out, frames);
                }
                Err(e) => warn!("Varispeed processing failed: {}", e),
            }
            for ch in &mut self.pending {
                ch.drain(..needed);
            }
        }
    }
}

impl TimeStretch for VarispeedStretcher {
    fn put_samples(&mut self, samples: &[f32], frames: usize) {
        let frames = frames.min(samples.len() / self.channels);
        for frame in samples[..frames * self.channels].chunks_exact(self.channels) {
            for (ch, &s) in self.pending.iter_mut().zip(frame) {
                ch.push(s);
            }
        }
        self.process_pending();
    }

    fn receive_samples(&mut self, dest: &mut [f32], max_frames: usize) -> usize {
        let frames = max_frames
            .min(dest.len() / self.channels)
            .min(self.output.len() / self.channels);
        for (d, s) in dest[..frames * self.channels]
            .iter_mut()
            .zip(self.output.drain(..frames * self.channels))
        {
            *d = s;
        }
        frames
    }

    fn flush(&mut self) {
        let remaining = self.pending[0].len();
        if remaining == 0 {
            return;
        }
        let Some(needed) = self.resampler.as_ref().map(|r| r.input_frames_next()) else {
            self.process_pending();
            return;
        };

        for ch in &mut self.pending {
            ch.resize(needed.max(remaining), 0.0);
        }
        let expected = (remaining as f64 / self.playback_rate()).round() as usize;
        let before = self.output.len();
        self.process_pending();

        // Drop the output produced by the zero padding
        let produced = (self.output.len() - before) / self.channels;
        if produced > expected {
            let excess = (produced - expected) * self.channels;
            self.output.truncate(self.output.len() - excess);
        }
        self.pending.iter_mut().for_each(Vec::clear);
    }

    fn clear(&mut self) {
        self.pending.iter_mut().for_each(Vec::clear);
        self.output.clear();
        self.resampler = self.build_resampler();
    }

    fn available_frames(&self) -> usize {
        self.output.len() / self.channels
    }

    fn set_tempo_change(&mut self, percent: f32) {
        self.tempo = percent.clamp(TEMPO_RANGE.0, TEMPO_RANGE.1);
        self.update_ratio();
    }

    fn tempo_change(&self) -> f32 {
        self.tempo
    }

    fn set_pitch_semitones(&mut self, semitones: f32) {
        self.pitch = semitones.clamp(PITCH_RANGE.0, PITCH_RANGE.1);
        self.update_ratio();
    }

    fn pitch_semitones(&self) -> f32 {
        self.pitch
    }
}
