//! Decoder collaborator interface
//!
//! The engine never decodes anything itself. A [`DecoderFactory`] opens a
//! fresh [`Decoder`] whenever one is needed: at load time, for full-stream
//! dumps, and again after a decode failure when the old one is disposed.

use crate::error::DecodeError;
use crate::frame::{AudioFrame, StreamInfo};
use std::time::Duration;

/// File or stream to PCM frame decoder
pub trait Decoder: Send {
    /// Stream properties
    fn info(&self) -> StreamInfo;

    /// Decode the next frame; `Ok(None)` marks the end of the stream
    fn decode_next_frame(&mut self) -> Result<Option<AudioFrame>, DecodeError>;

    /// Decode everything from `start` to the end as native-endian `f32` bytes
    fn decode_all_frames(&mut self, start: Duration) -> Result<Vec<u8>, DecodeError>;

    /// Reposition the stream
    fn try_seek(&mut self, position: Duration) -> Result<(), DecodeError>;
}

/// Opens decoders for one stream
pub trait DecoderFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError>;

    /// Human-readable name of the stream, used in logs
    fn describe(&self) -> String {
        String::from("stream")
    }
}

impl<F> DecoderFactory for F
where
    F: Fn() -> Result<Box<dyn Decoder>, DecodeError> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        self()
    }
}
