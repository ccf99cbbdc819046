//! Audio sources
//!
//! Every track in a mix is a [`Source`]: a closed set of variants sharing
//! one capability surface. Each variant stages samples in a ring buffer and
//! publishes fixed-size blocks on a bounded queue that the mixer drains one
//! block per tick.

mod base;
mod file;
mod input;
mod silent;
mod synthetic;

pub use self::base::{SourceContext, SourceKind};
pub use file::FileSource;
pub use input::InputSource;
pub use silent::SilentSource;
pub use synthetic::SyntheticSource;

use self::base::SourceCore;
use crate::effect::Effect;
use crate::error::Result;
use crate::events::SourceId;
use crate::frame::AudioBlock;
use crate::state::PlaybackState;
use std::time::Duration;

/// One track of the mix
pub enum Source {
    File(FileSource),
    Input(InputSource),
    Synthetic(SyntheticSource),
    Silent(SilentSource),
}

impl Source {
    fn core(&self) -> &SourceCore {
        match self {
            Source::File(s) => s.core(),
            Source::Input(s) => s.core(),
            Source::Synthetic(s) => s.core(),
            Source::Silent(s) => s.core(),
        }
    }

    pub fn id(&self) -> SourceId {
        self.core().id
    }

    pub fn kind(&self) -> SourceKind {
        self.core().kind
    }

    pub fn state(&self) -> PlaybackState {
        self.core().state.get()
    }

    pub fn position(&self) -> Duration {
        self.core().position()
    }

    /// Stream length; zero for live and synthetic sources
    pub fn duration(&self) -> Duration {
        self.core().duration()
    }

    pub fn channels(&self) -> u16 {
        self.core().channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.core().sample_rate
    }

    /// Interleaved samples per emitted block
    pub fn block_samples(&self) -> usize {
        self.core().block_samples()
    }

    pub fn volume(&self) -> f32 {
        self.core().volume()
    }

    /// Set the gain, clamped to 0.0..=2.0
    pub fn set_volume(&self, volume: f32) {
        self.core().set_volume(volume);
    }

    /// Tempo change in percent; always 0 outside file sources
    pub fn tempo(&self) -> f32 {
        match self {
            Source::File(s) => s.tempo(),
            _ => 0.0,
        }
    }

    pub fn set_tempo(&self, percent: f32) {
        if let Source::File(s) = self {
            s.set_tempo(percent);
        }
    }

    /// Pitch shift in semitones; always 0 outside file sources
    pub fn pitch(&self) -> f32 {
        match self {
            Source::File(s) => s.pitch(),
            _ => 0.0,
        }
    }

    pub fn set_pitch(&self, semitones: f32) {
        if let Source::File(s) = self {
            s.set_pitch(semitones);
        }
    }

    /// Install (or clear) the custom effect run before volume
    pub fn set_effect(&self, effect: Option<Box<dyn Effect>>) {
        self.core().set_effect(effect);
    }

    /// Request `Playing`, `Paused` or `Idle`
    pub fn change_state(&self, state: PlaybackState) -> Result<()> {
        match self {
            Source::File(s) => s.change_state(state),
            Source::Input(s) => s.change_state(state),
            Source::Synthetic(s) => s.change_state(state),
            Source::Silent(s) => s.change_state(state),
        }
    }

    /// Reposition the source. Live and synthetic sources ignore this and
    /// return `Ok(false)`, as does a seek the decoder refuses.
    pub fn seek(&self, position: Duration) -> Result<bool> {
        match self {
            Source::File(s) => s.seek(position),
            Source::Silent(s) => s.seek(position),
            Source::Input(s) => s.core().ensure_live().map(|_| false),
            Source::Synthetic(s) => s.core().ensure_live().map(|_| false),
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Source::File(_) | Source::Silent(_))
    }

    /// Native-endian `f32` bytes of the whole stream from `position`
    pub fn byte_data(&self, position: Duration) -> Result<Vec<u8>> {
        match self {
            Source::File(s) => s.byte_data(position),
            _ => self.core().ensure_live().map(|_| Vec::new()),
        }
    }

    /// Samples of the whole stream from `position`
    pub fn float_data(&self, position: Duration) -> Result<Vec<f32>> {
        let bytes = self.byte_data(position)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Take the next block; the caller hands its buffer back to the pool
    pub fn try_next_block(&self) -> Option<AudioBlock> {
        self.core().try_next_block()
    }

    pub fn has_block(&self) -> bool {
        self.core().has_block()
    }

    pub fn queued_blocks(&self) -> usize {
        self.core().queued_blocks()
    }

    /// True once the last block of a finite source has been emitted
    pub fn is_finished(&self) -> bool {
        self.core().is_finished()
    }

    pub fn is_disposed(&self) -> bool {
        self.core().is_disposed()
    }

    pub fn as_file(&self) -> Option<&FileSource> {
        match self {
            Source::File(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_synthetic(&self) -> Option<&SyntheticSource> {
        match self {
            Source::Synthetic(s) => Some(s),
            _ => None,
        }
    }

    /// Stop the tasks and return every pooled buffer; later calls do nothing
    pub fn dispose(&self) {
        match self {
            Source::File(s) => s.dispose(),
            Source::Input(s) => s.dispose(),
            Source::Synthetic(s) => s.dispose(),
            Source::Silent(s) => s.dispose(),
        }
    }
}

impl From<FileSource> for Source {
    fn from(source: FileSource) -> Self {
        Source::File(source)
    }
}

impl From<InputSource> for Source {
    fn from(source: InputSource) -> Self {
        Source::Input(source)
    }
}

impl From<SyntheticSource> for Source {
    fn from(source: SyntheticSource) -> Self {
        Source::Synthetic(source)
    }
}

impl From<SilentSource> for Source {
    fn from(source: SilentSource) -> Self {
        Source::Silent(source)
    }
}
