//! Shared playback state primitives
//!
//! Every source and the orchestrator drive their transport through a
//! [`StateCell`] and publish time through a [`DurationCell`]. Both are plain
//! atomics so the audio threads can read them without taking a lock.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// Transport state of a source or of the whole engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Initial and terminal state of every play session
    #[default]
    Idle,
    Playing,
    Paused,
    /// Playing, but no data was ready for the last tick
    Buffering,
    /// Playing with live input mixed into the master bus
    Recording,
}

impl PlaybackState {
    fn to_u8(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Paused => 2,
            PlaybackState::Buffering => 3,
            PlaybackState::Recording => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            3 => PlaybackState::Buffering,
            4 => PlaybackState::Recording,
            _ => PlaybackState::Idle,
        }
    }

    /// True for every state in which producers should keep producing
    pub fn is_running(self) -> bool {
        matches!(
            self,
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::Recording
        )
    }
}

/// Atomic holder for a [`PlaybackState`]
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: PlaybackState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state` and return the previous state if it changed.
    ///
    /// Re-entering the current state returns `None`, which callers use to
    /// suppress duplicate notifications.
    pub fn transition(&self, state: PlaybackState) -> Option<PlaybackState> {
        let previous = PlaybackState::from_u8(self.0.swap(state.to_u8(), Ordering::AcqRel));
        (previous != state).then_some(previous)
    }

    /// Move from `from` to `to` only if `from` is the current state
    pub fn transition_from(&self, from: PlaybackState, to: PlaybackState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && from != to
    }

    pub fn is_idle(&self) -> bool {
        self.get() == PlaybackState::Idle
    }
}

/// Atomic time value stored as whole microseconds
#[derive(Debug, Default)]
pub struct DurationCell(AtomicU64);

impl DurationCell {
    pub fn new(value: Duration) -> Self {
        Self(AtomicU64::new(value.as_micros() as u64))
    }

    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Acquire))
    }

    /// Store `value`; returns false when the stored value did not change
    pub fn set(&self, value: Duration) -> bool {
        let micros = value.as_micros() as u64;
        self.0.swap(micros, Ordering::AcqRel) != micros
    }

    /// Add `delta` and return the new value
    pub fn advance(&self, delta: Duration) -> Duration {
        let micros = delta.as_micros() as u64;
        Duration::from_micros(self.0.fetch_add(micros, Ordering::AcqRel) + micros)
    }
}

/// `f32` stored in an `AtomicU32` bit pattern
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Absolute difference between two time values
#[inline]
pub fn distance(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Duration of `samples` interleaved samples at the given format
#[inline]
pub fn samples_to_duration(samples: usize, sample_rate: u32, channels: u16) -> Duration {
    let denom = sample_rate as u128 * channels.max(1) as u128;
    if denom == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u128 * 1_000_000_000 / denom) as u64)
}
