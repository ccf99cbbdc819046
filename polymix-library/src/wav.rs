//! Wave export of captured mixes

use polymix_audio::capture::read_raw;
use polymix_audio::CaptureSummary;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Wave encoding error: {0}")]
    Encode(#[from] hound::Error),
}

/// Sample encoding of the exported file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    /// 16-bit PCM
    #[default]
    Int16,
    /// 32-bit IEEE float, lossless for the engine's samples
    Float32,
}

impl BitDepth {
    fn spec(self, sample_rate: u32, channels: u16) -> hound::WavSpec {
        match self {
            BitDepth::Int16 => hound::WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            BitDepth::Float32 => hound::WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            },
        }
    }
}

/// Write interleaved samples to a wave file
pub fn write_wav(
    path: &Path,
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
    depth: BitDepth,
) -> Result<(), WavError> {
    let mut writer = hound::WavWriter::create(path, depth.spec(sample_rate, channels))?;
    match depth {
        BitDepth::Int16 => {
            for &sample in samples {
                let clamped = sample.clamp(-1.0, 1.0);
                writer.write_sample((clamped * 32767.0) as i16)?;
            }
        }
        BitDepth::Float32 => {
            for &sample in samples {
                writer.write_sample(sample)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

/// Convert a finished raw capture into a wave file; returns the frame count
pub fn export_capture(
    summary: &CaptureSummary,
    out: &Path,
    depth: BitDepth,
) -> Result<u64, WavError> {
    let samples = read_raw(&summary.path)?;
    write_wav(out, &samples, summary.sample_rate, summary.channels, depth)?;
    let frames = samples.len() as u64 / summary.channels.max(1) as u64;
    info!(
        "Exported {} frames ({:.2}s) to {}",
        frames,
        frames as f64 / summary.sample_rate.max(1) as f64,
        out.display()
    );
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polymix_audio::CaptureWriter;

    fn capture(dir: &Path, samples: &[f32]) -> CaptureSummary {
        let mut writer = CaptureWriter::create(dir.join("mix.raw"), 1000, 2).unwrap();
        writer.write(samples).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_float_export_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let samples = [0.1, -0.2, 0.3, -0.4];
        let summary = capture(dir.path(), &samples);

        let out = dir.path().join("mix.wav");
        assert_eq!(export_capture(&summary, &out, BitDepth::Float32).unwrap(), 2);

        let mut reader = hound::WavReader::open(&out).unwrap();
        assert_eq!(reader.spec().sample_rate, 1000);
        assert_eq!(reader.spec().channels, 2);
        let read: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn test_int_export_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let summary = capture(dir.path(), &[2.0, -2.0, 0.5, 0.0]);

        let out = dir.path().join("mix.wav");
        export_capture(&summary, &out, BitDepth::Int16).unwrap();

        let mut reader = hound::WavReader::open(&out).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, vec![32767, -32767, 16383, 0]);
    }
}
