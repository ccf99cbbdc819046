//! Audio engine for polymix - sources, pooled buffers and the mixer
//!
//! This crate provides the real-time playback pipeline:
//! - Sources: file, live input, synthetic and silent tracks
//! - Buffers: pooled sample buffers and ring staging
//! - Orchestrator: mixer thread, transport and drift correction
//! - Devices: cpal output plus a null device for tests and offline runs

pub mod buffers;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod device;
pub mod effect;
mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod meter;
mod mixer;
pub mod source;
pub mod state;
pub mod stretch;

pub use buffers::{BufferPool, PoolStats, RingSampleBuffer};
pub use capture::{CaptureSummary, CaptureWriter};
pub use config::{DeviceOptions, EngineConfig, SourceSettings};
pub use decoder::{Decoder, DecoderFactory};
pub use device::{CpalDevice, NullDevice, OutputDevice};
pub use effect::Effect;
pub use engine::Orchestrator;
pub use error::{DecodeError, DeviceError, EngineError, Result};
pub use events::{EngineEvent, EventBus, SourceId};
pub use frame::{AudioBlock, AudioFrame, SampleFormat, StreamInfo};
pub use meter::{LevelMeter, LevelSnapshot};
pub use mixer::MasterBus;
pub use source::{
    FileSource, InputSource, SilentSource, Source, SourceContext, SourceKind, SyntheticSource,
};
pub use state::PlaybackState;
pub use stretch::{StretchFactory, TimeStretch, VarispeedStretcher};
