//! File-side collaborators for polymix - decoding, config, and wave export

pub mod config;
mod decoder;
pub mod wav;

pub use config::{Config, ConfigError};
pub use decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};
pub use wav::{export_capture, write_wav, BitDepth, WavError};
