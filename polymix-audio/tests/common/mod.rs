//! Shared fixtures: a scripted decoder and event helpers

#![allow(dead_code)]

use polymix_audio::{
    AudioFrame, DecodeError, Decoder, DecoderFactory, EngineEvent, SampleFormat, SourceSettings,
    StreamInfo,
};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub enum Waveform {
    /// Sample value equals its frame index
    Ramp,
    Constant(f32),
}

/// Behaviour of every decoder a [`ScriptedFactory`] opens
pub struct Script {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
    /// Sample frames per decoded frame
    pub chunk: usize,
    pub waveform: Waveform,
    pub format: SampleFormat,
    /// The first decoder to reach this frame index fails once
    pub fail_at: Option<usize>,
    pub refuse_seek: bool,
    failed: AtomicBool,
    /// Opens that fail before one succeeds
    open_failures: AtomicUsize,
    opens: AtomicUsize,
}

impl Script {
    pub fn new(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self {
            sample_rate,
            channels,
            frames,
            chunk: 64,
            waveform: Waveform::Constant(0.25),
            format: SampleFormat::F32,
            fail_at: None,
            refuse_seek: false,
            failed: AtomicBool::new(false),
            open_failures: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn ramp(mut self) -> Self {
        self.waveform = Waveform::Ramp;
        self
    }

    pub fn constant(mut self, value: f32) -> Self {
        self.waveform = Waveform::Constant(value);
        self
    }

    pub fn chunk(mut self, frames: usize) -> Self {
        self.chunk = frames;
        self
    }

    pub fn format(mut self, format: SampleFormat) -> Self {
        self.format = format;
        self
    }

    pub fn fail_at(mut self, frame: usize) -> Self {
        self.fail_at = Some(frame);
        self
    }

    pub fn refuse_seek(mut self) -> Self {
        self.refuse_seek = true;
        self
    }

    pub fn open_failures(self, count: usize) -> Self {
        self.open_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn factory(self) -> Arc<ScriptedFactory> {
        Arc::new(ScriptedFactory(Arc::new(self)))
    }

    fn value(&self, frame: usize) -> f32 {
        match self.waveform {
            Waveform::Ramp => frame as f32,
            Waveform::Constant(v) => v,
        }
    }
}

pub struct ScriptedFactory(pub Arc<Script>);

impl ScriptedFactory {
    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.0.failed.load(Ordering::SeqCst)
    }
}

impl DecoderFactory for ScriptedFactory {
    fn open(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let pending = self.0.open_failures.load(Ordering::SeqCst);
        if pending > 0 && self.0.failed.load(Ordering::SeqCst) {
            self.0.open_failures.store(pending - 1, Ordering::SeqCst);
            return Err(DecodeError::Unsupported("scripted open failure".into()));
        }
        Ok(Box::new(ScriptedDecoder {
            script: self.0.clone(),
            cursor: 0,
        }))
    }

    fn describe(&self) -> String {
        String::from("scripted stream")
    }
}

pub struct ScriptedDecoder {
    script: Arc<Script>,
    cursor: usize,
}

impl Decoder for ScriptedDecoder {
    fn info(&self) -> StreamInfo {
        let s = &self.script;
        StreamInfo {
            sample_rate: s.sample_rate,
            channels: s.channels,
            duration: Duration::from_secs_f64(s.frames as f64 / s.sample_rate as f64),
            format: s.format,
        }
    }

    fn decode_next_frame(&mut self) -> Result<Option<AudioFrame>, DecodeError> {
        let s = &self.script;
        if self.cursor >= s.frames {
            return Ok(None);
        }
        if let Some(at) = s.fail_at {
            if self.cursor >= at && !s.failed.swap(true, Ordering::SeqCst) {
                return Err(DecodeError::Decode("scripted failure".into()));
            }
        }
        let end = (self.cursor + s.chunk).min(s.frames);
        let samples: Vec<f32> = (self.cursor..end)
            .flat_map(|i| std::iter::repeat(s.value(i)).take(s.channels as usize))
            .collect();
        let pts = Duration::from_secs_f64(self.cursor as f64 / s.sample_rate as f64);
        self.cursor = end;
        Ok(Some(AudioFrame::from_samples(&samples, pts)))
    }

    fn decode_all_frames(&mut self, start: Duration) -> Result<Vec<u8>, DecodeError> {
        self.try_seek(start)?;
        let mut bytes = Vec::new();
        while let Some(frame) = self.decode_next_frame()? {
            bytes.extend_from_slice(&frame.data);
        }
        Ok(bytes)
    }

    fn try_seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        let s = &self.script;
        if s.refuse_seek && position > Duration::ZERO {
            return Err(DecodeError::Seek("scripted refusal".into()));
        }
        let frame = position.as_micros() * s.sample_rate as u128 / 1_000_000;
        self.cursor = (frame as usize).min(s.frames);
        Ok(())
    }
}

/// Small blocks and short sleeps so tests run quickly
pub fn fast_settings(block_frames: usize) -> SourceSettings {
    SourceSettings {
        block_frames,
        recovery_retry_interval: Duration::from_millis(5),
        yield_interval: Duration::from_micros(200),
        ..Default::default()
    }
}

/// Poll `cond` for up to `timeout`
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Collect events until `pred` matches one or `timeout` elapses
pub fn wait_for_event(
    events: &Receiver<EngineEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let done = pred(&event);
                seen.push(event);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    seen
}
