//! Streaming file decoder using Symphonia

use polymix_audio::{AudioFrame, DecodeError, Decoder, DecoderFactory, SampleFormat, StreamInfo};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

/// Packet-by-packet decoder for one audio file.
///
/// Frames come out as interleaved `f32` at the file's own sample rate.
pub struct SymphoniaDecoder {
    name: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    info: StreamInfo,
    /// Frames to drop after an accurate seek landed early
    skip_frames: u64,
    /// Set when a seek lands at or past the end
    exhausted: bool,
}

impl SymphoniaDecoder {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let params = track.codec_params.clone();
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| DecodeError::Unsupported("unknown sample rate".into()))?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let time_base = params.time_base;
        let duration = match (params.n_frames, time_base) {
            (Some(frames), Some(tb)) => time_to_duration(tb.calc_time(frames)),
            (Some(frames), None) => Duration::from_secs_f64(frames as f64 / sample_rate as f64),
            _ => Duration::ZERO,
        };

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Unsupported(e.to_string()))?;

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string();
        debug!(
            "Opened {}: {} Hz, {} ch, {:.2}s",
            name,
            sample_rate,
            channels,
            duration.as_secs_f64()
        );

        Ok(Self {
            name,
            format,
            decoder,
            track_id,
            time_base,
            info: StreamInfo {
                sample_rate,
                channels,
                duration,
                format: SampleFormat::F32,
            },
            skip_frames: 0,
            exhausted: false,
        })
    }

    fn timestamp(&self, ts: u64) -> Duration {
        match self.time_base {
            Some(tb) => time_to_duration(tb.calc_time(ts)),
            None => Duration::from_secs_f64(ts as f64 / self.info.sample_rate as f64),
        }
    }
}

fn time_to_duration(time: Time) -> Duration {
    Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac)
}

impl Decoder for SymphoniaDecoder {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn decode_next_frame(&mut self) -> Result<Option<AudioFrame>, DecodeError> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(DecodeError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt packet in {}: {}", self.name, e);
                    continue;
                }
                Err(e) => return Err(DecodeError::Decode(e.to_string())),
            };

            // Convert to f32 interleaved
            let spec = *decoded.spec();
            let channels = spec.channels.count().max(1);
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let mut samples = sample_buf.samples();
            let mut ts = packet.ts();
            if self.skip_frames > 0 {
                let skip = self.skip_frames.min((samples.len() / channels) as u64);
                self.skip_frames -= skip;
                samples = &samples[skip as usize * channels..];
                ts += skip;
            }
            if samples.is_empty() {
                continue;
            }

            return Ok(Some(AudioFrame::from_samples(samples, self.timestamp(ts))));
        }
    }

    fn decode_all_frames(&mut self, start: Duration) -> Result<Vec<u8>, DecodeError> {
        if start > Duration::ZERO {
            self.try_seek(start)?;
        }
        let mut bytes = Vec::new();
        while let Some(frame) = self.decode_next_frame()? {
            bytes.extend_from_slice(&frame.data);
        }
        Ok(bytes)
    }

    fn try_seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        let duration = self.info.duration;
        if duration > Duration::ZERO && position >= duration {
            self.exhausted = true;
            self.skip_frames = 0;
            return Ok(());
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position.as_secs_f64()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| DecodeError::Seek(e.to_string()))?;

        self.decoder.reset();
        self.exhausted = false;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        Ok(())
    }
}

/// Opens a [`SymphoniaDecoder`] for one path, as often as the engine asks
#[derive(Debug, Clone)]
pub struct SymphoniaDecoderFactory {
    path: PathBuf,
}

impl SymphoniaDecoderFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        Ok(Box::new(SymphoniaDecoder::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path, sample_rate: u32, frames: usize) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let s = (i as f32 / frames as f32) - 0.5;
            writer.write_sample(s).unwrap();
            writer.write_sample(-s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_open_reports_stream_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8000, 8000);

        let decoder = SymphoniaDecoder::open(&path).unwrap();
        let info = decoder.info();
        assert_eq!(info.sample_rate, 8000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.format, SampleFormat::F32);
        assert!((info.duration.as_secs_f64() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_decodes_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8000, 8000);

        let mut decoder = SymphoniaDecoder::open(&path).unwrap();
        let bytes = decoder.decode_all_frames(Duration::ZERO).unwrap();
        assert_eq!(bytes.len(), 8000 * 2 * 4);

        let first = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert!((first + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_seek_lands_on_the_requested_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8000, 8000);

        let mut decoder = SymphoniaDecoder::open(&path).unwrap();
        decoder.try_seek(Duration::from_millis(500)).unwrap();
        let frame = decoder.decode_next_frame().unwrap().unwrap();
        let mut samples = Vec::new();
        frame.samples_into(&mut samples).unwrap();
        assert!((samples[0] - 0.0).abs() < 1e-3);
        assert!((frame.presentation_time.as_secs_f64() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_seek_to_end_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 8000, 800);

        let mut decoder = SymphoniaDecoder::open(&path).unwrap();
        decoder.try_seek(Duration::from_secs(3)).unwrap();
        assert!(decoder.decode_next_frame().unwrap().is_none());

        decoder.try_seek(Duration::ZERO).unwrap();
        assert!(decoder.decode_next_frame().unwrap().is_some());
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let factory = SymphoniaDecoderFactory::new("/nonexistent/track.flac");
        assert!(matches!(factory.open(), Err(DecodeError::Io(_))));
    }
}
