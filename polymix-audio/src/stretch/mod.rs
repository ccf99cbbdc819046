//! Time-stretch collaborator interface
//!
//! A file source routes its samples through a [`TimeStretch`] whenever its
//! tempo or pitch is non-zero. The processor is fed interleaved frames,
//! buffers internally, and hands back processed frames on demand.

mod varispeed;

pub use varispeed::VarispeedStretcher;

use std::sync::Arc;

/// Tempo change range in percent
pub const TEMPO_RANGE: (f32, f32) = (-50.0, 100.0);
/// Pitch shift range in semitones
pub const PITCH_RANGE: (f32, f32) = (-12.0, 12.0);

/// Tempo/pitch processor with a fixed sample rate and channel count
pub trait TimeStretch: Send {
    /// Feed `frames` interleaved frames
    fn put_samples(&mut self, samples: &[f32], frames: usize);

    /// Move up to `max_frames` processed frames into `dest`; returns frames written
    fn receive_samples(&mut self, dest: &mut [f32], max_frames: usize) -> usize;

    /// Push any internally held input through so it can be received
    fn flush(&mut self);

    /// Drop all buffered input and output
    fn clear(&mut self);

    /// Processed frames ready to be received
    fn available_frames(&self) -> usize;

    /// Tempo change in percent (0 = unchanged)
    fn set_tempo_change(&mut self, percent: f32);
    fn tempo_change(&self) -> f32;

    /// Pitch shift in semitones (0 = unchanged)
    fn set_pitch_semitones(&mut self, semitones: f32);
    fn pitch_semitones(&self) -> f32;
}

/// Builds a stretcher for `(sample_rate, channels)`
pub type StretchFactory = Arc<dyn Fn(u32, u16) -> Box<dyn TimeStretch> + Send + Sync>;

/// Factory for the built-in [`VarispeedStretcher`]
pub fn default_factory() -> StretchFactory {
    Arc::new(|sample_rate, channels| Box::new(VarispeedStretcher::new(sample_rate, channels)))
}
