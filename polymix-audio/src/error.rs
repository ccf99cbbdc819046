//! Error types for the engine and its collaborators

use crate::state::PlaybackState;
use thiserror::Error;

/// Errors raised by a decoder
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in stream")]
    NoAudioTrack,
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Seek error: {0}")]
    Seek(String),
    #[error("Frame payload of {len} bytes is not a whole number of f32 samples")]
    MisalignedFrame { len: usize },
}

/// Errors raised by an output device engine
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No audio {0} device found")]
    NoDevice(&'static str),
    #[error("Device configuration error: {0}")]
    Config(String),
    #[error("Failed to build audio stream: {0}")]
    Build(String),
    #[error("Failed to start audio stream: {0}")]
    Play(String),
}

/// Errors surfaced to callers of the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unsupported channel mixing: {input} -> {output} channels")]
    UnsupportedChannelLayout { input: u16, output: u16 },
    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),
    #[error("{0} is only allowed while the engine is idle")]
    NotIdle(&'static str),
    #[error("Cannot request state {0:?} directly")]
    InvalidState(PlaybackState),
    #[error("Source has been disposed")]
    Disposed,
    #[error("Source {0} not found")]
    SourceNotFound(u64),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
