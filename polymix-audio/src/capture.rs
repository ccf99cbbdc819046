//! Live-mix capture to a raw sample file
//!
//! The file is an append-only stream of native-endian `f32` samples with no
//! header. The format travels alongside in a [`CaptureSummary`] so a wave
//! writer can wrap it afterwards.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// What was captured and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples written
    pub samples: u64,
}

/// Buffered raw sample writer
pub struct CaptureWriter {
    writer: BufWriter<File>,
    summary: CaptureSummary,
}

impl CaptureWriter {
    /// Create (or truncate) the capture file
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, channels: u16) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            summary: CaptureSummary {
                path,
                sample_rate,
                channels,
                samples: 0,
            },
        })
    }

    pub fn write(&mut self, samples: &[f32]) -> io::Result<()> {
        for s in samples {
            self.writer.write_all(&s.to_ne_bytes())?;
        }
        self.summary.samples += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.summary.samples
    }

    /// Flush and close the file
    pub fn finish(mut self) -> io::Result<CaptureSummary> {
        self.writer.flush()?;
        Ok(self.summary)
    }
}

/// Read a raw capture file back into samples
pub fn read_raw(path: impl AsRef<Path>) -> io::Result<Vec<f32>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_appends_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.raw");

        let mut writer = CaptureWriter::create(&path, 48000, 2).unwrap();
        writer.write(&[0.25, -0.5]).unwrap();
        writer.write(&[1.0]).unwrap();
        let summary = writer.finish().unwrap();

        assert_eq!(summary.samples, 3);
        assert_eq!(summary.sample_rate, 48000);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12);
        assert_eq!(read_raw(&path).unwrap(), vec![0.25, -0.5, 1.0]);
    }
}
