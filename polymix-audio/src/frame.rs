//! Decoded frames and pooled sample blocks

use crate::error::DecodeError;
use std::time::Duration;

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Sample encoding advertised by a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Interleaved native-endian 32-bit IEEE-754 floats
    #[default]
    F32,
    I16,
    I32,
}

/// Stream properties reported by a decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Duration,
    pub format: SampleFormat,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            duration: Duration::ZERO,
            format: SampleFormat::F32,
        }
    }
}

/// One decoder-produced unit: raw sample bytes plus presentation time
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    /// Interleaved native-endian `f32` samples
    pub data: Vec<u8>,
    pub presentation_time: Duration,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, presentation_time: Duration) -> Self {
        Self {
            data,
            presentation_time,
        }
    }

    /// Encode `samples` as a frame payload
    pub fn from_samples(samples: &[f32], presentation_time: Duration) -> Self {
        let mut data = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
        for s in samples {
            data.extend_from_slice(&s.to_ne_bytes());
        }
        Self::new(data, presentation_time)
    }

    /// Number of samples in the payload, if it is well-formed
    pub fn sample_count(&self) -> Option<usize> {
        (self.data.len() % SAMPLE_BYTES == 0).then(|| self.data.len() / SAMPLE_BYTES)
    }

    /// Decode the payload into `out`, replacing its contents.
    ///
    /// Payloads that are not a whole number of `f32` samples are rejected
    /// rather than silently truncated.
    pub fn samples_into(&self, out: &mut Vec<f32>) -> Result<(), DecodeError> {
        if self.data.len() % SAMPLE_BYTES != 0 {
            return Err(DecodeError::MisalignedFrame {
                len: self.data.len(),
            });
        }
        out.clear();
        out.extend(
            self.data
                .chunks_exact(SAMPLE_BYTES)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        Ok(())
    }
}

/// A fixed-size block of interleaved samples backed by a pooled buffer.
///
/// The backing buffer may be longer than the block (pool buckets are powers
/// of two); only the first `len` samples are meaningful.
#[derive(Debug)]
pub struct AudioBlock {
    buffer: Vec<f32>,
    len: usize,
}

impl AudioBlock {
    pub fn new(buffer: Vec<f32>, len: usize) -> Self {
        let len = len.min(buffer.len());
        Self { buffer, len }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.buffer[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hand back the backing buffer, typically to [`crate::BufferPool::recycle`]
    pub fn into_buffer(self) -> Vec<f32> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_decodes_native_endian_floats() {
        let frame = AudioFrame::from_samples(&[0.5, -1.0, 0.25], Duration::from_millis(3));
        assert_eq!(frame.sample_count(), Some(3));

        let mut out = vec![9.0];
        frame.samples_into(&mut out).unwrap();
        assert_eq!(out, vec![0.5, -1.0, 0.25]);
    }

    #[test]
    fn test_misaligned_frame_is_rejected() {
        let frame = AudioFrame::new(vec![0u8; 7], Duration::ZERO);
        assert_eq!(frame.sample_count(), None);

        let mut out = Vec::new();
        let err = frame.samples_into(&mut out).unwrap_err();
        assert!(matches!(err, DecodeError::MisalignedFrame { len: 7 }));
    }

    #[test]
    fn test_block_exposes_only_valid_samples() {
        let block = AudioBlock::new(vec![1.0; 128], 100);
        assert_eq!(block.len(), 100);
        assert_eq!(block.as_slice().len(), 100);
        assert_eq!(block.into_buffer().len(), 128);
    }
}
