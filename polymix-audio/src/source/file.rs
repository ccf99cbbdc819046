//! File-backed source: decode task plus process task
//!
//! The decode task pulls frames from the decoder into a bounded frame queue.
//! The process task drains that queue, optionally through a time-stretcher,
//! stages samples in the ring buffer and emits fixed-size blocks onto the
//! output queue the mixer reads from.
//!
//! Locks are always taken decoder first, pipeline second.

use super::base::{SourceContext, SourceCore, SourceKind, TaskSet};
use crate::decoder::{Decoder, DecoderFactory};
use crate::error::{DecodeError, EngineError, Result};
use crate::events::EngineEvent;
use crate::frame::{AudioFrame, SampleFormat, StreamInfo};
use crate::state::{AtomicF32, PlaybackState};
use crate::stretch::{StretchFactory, TimeStretch, PITCH_RANGE, TEMPO_RANGE};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Staging state guarded by the source's coarse lock
struct Pipeline {
    stretcher: Box<dyn TimeStretch>,
    /// Decoded frame samples
    samples: Vec<f32>,
    /// Destination for stretched output
    stretched: Vec<f32>,
    /// True while samples are routed through the stretcher
    stretching: bool,
    /// Prebuffering is done for this start or seek
    primed: bool,
}

struct FileShared {
    core: SourceCore,
    factory: Arc<dyn DecoderFactory>,
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    info: StreamInfo,
    frames_tx: Sender<AudioFrame>,
    frames_rx: Receiver<AudioFrame>,
    pipeline: Mutex<Pipeline>,
    tempo: AtomicF32,
    pitch: AtomicF32,
    end_of_stream: AtomicBool,
    /// Bumped by every successful seek
    seek_generation: AtomicU64,
}

/// Decoded audio track
pub struct FileSource {
    shared: Arc<FileShared>,
    tasks: TaskSet,
}

impl FileSource {
    /// Open a decoder and prepare the source; it starts Idle at position 0
    pub fn open(
        ctx: SourceContext,
        factory: Arc<dyn DecoderFactory>,
        stretch: &StretchFactory,
    ) -> Result<Self> {
        let decoder = factory.open()?;
        let info = decoder.info();
        if info.format != SampleFormat::F32 {
            return Err(EngineError::UnsupportedSampleFormat(format!(
                "{:?} in {}",
                info.format,
                factory.describe()
            )));
        }
        if info.channels == 0 || info.sample_rate == 0 {
            return Err(DecodeError::Unsupported(format!(
                "{} reports {} Hz, {} channels",
                factory.describe(),
                info.sample_rate,
                info.channels
            ))
            .into());
        }

        let core = SourceCore::new(
            &ctx,
            SourceKind::File,
            info.channels,
            info.sample_rate,
            info.duration,
        );
        let block = core.block_samples();
        let (frames_tx, frames_rx) = bounded(ctx.settings.max_queue_frames.max(1));

        info!(
            "Source {} loaded {} ({} Hz, {} ch, {:.2}s)",
            ctx.id,
            factory.describe(),
            info.sample_rate,
            info.channels,
            info.duration.as_secs_f64()
        );

        Ok(Self {
            shared: Arc::new(FileShared {
                core,
                factory,
                decoder: Mutex::new(Some(decoder)),
                info,
                frames_tx,
                frames_rx,
                pipeline: Mutex::new(Pipeline {
                    stretcher: stretch(info.sample_rate, info.channels),
                    samples: Vec::with_capacity(block),
                    stretched: vec![0.0; block],
                    stretching: false,
                    primed: false,
                }),
                tempo: AtomicF32::new(0.0),
                pitch: AtomicF32::new(0.0),
                end_of_stream: AtomicBool::new(false),
                seek_generation: AtomicU64::new(0),
            }),
            tasks: TaskSet::default(),
        })
    }

    pub(crate) fn core(&self) -> &SourceCore {
        &self.shared.core
    }

    pub fn info(&self) -> StreamInfo {
        self.shared.info
    }

    pub fn describe(&self) -> String {
        self.shared.factory.describe()
    }

    /// Frames currently waiting between the two tasks
    pub fn queued_frames(&self) -> usize {
        self.shared.frames_rx.len()
    }

    pub fn tempo(&self) -> f32 {
        self.shared.tempo.load()
    }

    /// Tempo change in percent, clamped to the stretcher's range
    pub fn set_tempo(&self, percent: f32) {
        self.shared
            .tempo
            .store(percent.clamp(TEMPO_RANGE.0, TEMPO_RANGE.1));
    }

    pub fn pitch(&self) -> f32 {
        self.shared.pitch.load()
    }

    /// Pitch shift in semitones, clamped to the stretcher's range
    pub fn set_pitch(&self, semitones: f32) {
        self.shared
            .pitch
            .store(semitones.clamp(PITCH_RANGE.0, PITCH_RANGE.1));
    }

    pub fn change_state(&self, state: PlaybackState) -> Result<()> {
        self.core().ensure_live()?;
        let current = self.core().state.get();
        match state {
            PlaybackState::Idle => {
                self.stop();
                Ok(())
            }
            PlaybackState::Playing | PlaybackState::Paused if current == PlaybackState::Idle => {
                self.start(state)
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                self.core().set_state(state);
                Ok(())
            }
            other => Err(EngineError::InvalidState(other)),
        }
    }

    fn start(&self, state: PlaybackState) -> Result<()> {
        let shared = &self.shared;
        let core = &shared.core;
        self.tasks.join_all();

        shared.end_of_stream.store(false, Ordering::Release);
        core.set_finished(false);
        {
            // Stop drained every queue, so pick up again at the current position
            let mut decoder = shared.decoder.lock();
            if decoder.is_none() {
                *decoder = Some(shared.factory.open()?);
            }
            if let Some(decoder) = decoder.as_mut() {
                if let Err(e) = decoder.try_seek(core.position()) {
                    warn!("Source {} could not rewind decoder: {}", core.id, e);
                }
            }
            shared.pipeline.lock().primed = false;
        }

        core.set_state(state);

        let decode = shared.clone();
        self.tasks
            .spawn(format!("polymix-decode-{}", core.id.0), move || decode.decode_loop())?;
        let process = shared.clone();
        self.tasks
            .spawn(format!("polymix-process-{}", core.id.0), move || process.process_loop())?;
        Ok(())
    }

    fn stop(&self) {
        let core = self.core();
        core.set_state(PlaybackState::Idle);
        self.tasks.join_all();
        self.shared.drain_frames();
        core.drain_blocks();
        let mut pipeline = self.shared.pipeline.lock();
        core.ring.clear();
        pipeline.stretcher.clear();
        pipeline.primed = false;
        core.reset_effect();
    }

    /// Reposition the stream. `Ok(false)` means the decoder refused and the
    /// position is unchanged.
    pub fn seek(&self, position: Duration) -> Result<bool> {
        let shared = &self.shared;
        let core = &shared.core;
        core.ensure_live()?;

        let position = match shared.info.duration {
            d if d > Duration::ZERO => position.min(d),
            _ => position,
        };

        core.set_seeking(true);
        let result = {
            let mut decoder = shared.decoder.lock();
            shared.drain_frames();
            let mut pipeline = shared.pipeline.lock();
            core.drain_blocks();
            core.ring.clear();
            pipeline.stretcher.clear();
            pipeline.primed = false;

            let result = match decoder.as_mut() {
                Some(decoder) => decoder.try_seek(position),
                None => Err(DecodeError::Seek("decoder unavailable".into())),
            };
            if result.is_ok() {
                shared.end_of_stream.store(false, Ordering::Release);
                core.set_finished(false);
                shared.seek_generation.fetch_add(1, Ordering::AcqRel);
                core.reset_effect();
                // Still under the pipeline lock, so no block can advance
                // the old position past this point
                core.set_position(position);
            }
            result
        };
        core.set_seeking(false);

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Source {} seek to {:?} failed: {}", core.id, position, e);
                Ok(false)
            }
        }
    }

    /// Decode the whole stream from `position` with a fresh decoder
    pub fn byte_data(&self, position: Duration) -> Result<Vec<u8>> {
        self.core().ensure_live()?;
        let mut decoder = self.shared.factory.open()?;
        Ok(decoder.decode_all_frames(position)?)
    }

    pub fn dispose(&self) {
        let core = self.core();
        if !core.mark_disposed() {
            return;
        }
        self.stop();
        *self.shared.decoder.lock() = None;
        info!("Source {} disposed", core.id);
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl FileShared {
    fn drain_frames(&self) {
        while self.frames_rx.try_recv().is_ok() {}
    }

    fn decode_loop(self: Arc<Self>) {
        let core = &self.core;
        debug!("Source {} decode task started", core.id);

        while !core.should_exit() {
            if core.is_seeking() {
                self.drain_frames();
                core.wait();
                continue;
            }

            let mut guard = self.decoder.lock();
            let result = match guard.as_mut() {
                Some(decoder) => decoder.decode_next_frame(),
                None => {
                    drop(guard);
                    if !self.recover() {
                        break;
                    }
                    continue;
                }
            };

            match result {
                Ok(Some(frame)) => self.enqueue(frame),
                Ok(None) => {
                    let generation = self.seek_generation.load(Ordering::Acquire);
                    self.end_of_stream.store(true, Ordering::Release);
                    drop(guard);
                    debug!("Source {} decoder reached end of stream", core.id);

                    // Park until a seek rewinds the stream or the source stops
                    while !core.should_exit()
                        && self.seek_generation.load(Ordering::Acquire) == generation
                    {
                        core.wait();
                    }
                }
                Err(e) => {
                    drop(guard);
                    warn!("Source {} decode failed: {}", core.id, e);
                    if !self.recover() {
                        self.end_of_stream.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        }
        debug!("Source {} decode task exiting", core.id);
    }

    /// Push a frame, yielding while the queue is full. The frame is dropped
    /// if the source stops or a seek begins.
    fn enqueue(&self, frame: AudioFrame) {
        let mut frame = frame;
        loop {
            match self.frames_tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.core.should_exit() || self.core.is_seeking() {
                        return;
                    }
                    frame = returned;
                    self.core.wait();
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Replace a failed decoder and resume where playback was.
    ///
    /// Returns false if the source went idle during recovery or the new
    /// decoder cannot reach the resume position.
    fn recover(&self) -> bool {
        let core = &self.core;
        self.drain_frames();
        // Blocks are only dispatched under the pipeline lock, so the
        // position read here matches the last sample handed out
        let resume = {
            let mut pipeline = self.pipeline.lock();
            core.ring.clear();
            pipeline.stretcher.clear();
            pipeline.primed = false;
            core.position()
        };
        warn!("Source {} recreating decoder, resuming at {:?}", core.id, resume);
        *self.decoder.lock() = None;

        let retry = core.settings.recovery_retry_interval;
        let mut decoder = loop {
            if core.should_exit() {
                info!("Source {} stopped during decoder recovery", core.id);
                return false;
            }
            match self.factory.open() {
                Ok(decoder) => break decoder,
                Err(e) => {
                    warn!(
                        "Source {} decoder recreation failed, retrying in {:?}: {}",
                        core.id, retry, e
                    );
                    let until = Instant::now() + retry;
                    while Instant::now() < until && !core.should_exit() {
                        core.wait();
                    }
                }
            }
        };

        if let Err(e) = decoder.try_seek(resume) {
            error!("Source {} cannot resume at {:?}: {}", core.id, resume, e);
            core.events.emit(EngineEvent::Error {
                source: Some(core.id),
                message: format!("decoder recovery failed: {}", e),
            });
            return false;
        }

        *self.decoder.lock() = Some(decoder);
        info!("Source {} decoder recovered at {:?}", core.id, resume);
        core.events.emit(EngineEvent::DecoderRecovered {
            source: core.id,
            position: resume,
        });
        true
    }

    fn process_loop(self: Arc<Self>) {
        let core = &self.core;
        let min_queue = core.settings.min_queue_frames;
        debug!("Source {} process task started", core.id);

        while !core.should_exit() {
            if core.state.get() == PlaybackState::Paused || core.is_seeking() {
                core.wait();
                continue;
            }

            let mut pipeline = self.pipeline.lock();
            if core.is_seeking() || core.is_finished() {
                drop(pipeline);
                core.wait();
                continue;
            }

            if core.ring.len() >= core.block_samples() {
                core.send_blocks();
                continue;
            }

            let end_of_stream = self.end_of_stream.load(Ordering::Acquire);
            if !pipeline.primed {
                if self.frames_rx.len() < min_queue && !end_of_stream {
                    drop(pipeline);
                    core.wait();
                    continue;
                }
                pipeline.primed = true;
            }

            match self.frames_rx.try_recv() {
                Ok(frame) => self.stage(&mut pipeline, &frame),
                Err(_) if end_of_stream => self.drain_tail(&mut pipeline),
                Err(_) => {
                    drop(pipeline);
                    core.wait();
                }
            }
        }
        debug!("Source {} process task exiting", core.id);
    }

    /// Convert one frame and stage it in the ring, through the stretcher
    /// when tempo or pitch is set.
    fn stage(&self, pipeline: &mut Pipeline, frame: &AudioFrame) {
        let core = &self.core;
        let channels = core.channels as usize;

        let mut samples = std::mem::take(&mut pipeline.samples);
        if let Err(e) = frame.samples_into(&mut samples) {
            warn!("Source {} dropped frame at {:?}: {}", core.id, frame.presentation_time, e);
            pipeline.samples = samples;
            return;
        }

        let tempo = self.tempo.load();
        let pitch = self.pitch.load();
        let stretch = tempo != 0.0 || pitch != 0.0;

        if stretch {
            if pipeline.stretcher.tempo_change() != tempo {
                pipeline.stretcher.set_tempo_change(tempo);
            }
            if pipeline.stretcher.pitch_semitones() != pitch {
                pipeline.stretcher.set_pitch_semitones(pitch);
            }
            pipeline.stretching = true;
            pipeline.stretcher.put_samples(&samples, samples.len() / channels);
            self.pull_stretched(pipeline);
        } else {
            if pipeline.stretching {
                // Back to unity: hand over what the stretcher still holds
                pipeline.stretcher.flush();
                self.pull_stretched(pipeline);
                pipeline.stretcher.clear();
                pipeline.stretching = false;
            }
            self.push_to_ring(&samples);
        }
        pipeline.samples = samples;
    }

    fn pull_stretched(&self, pipeline: &mut Pipeline) {
        let channels = self.core.channels as usize;
        let max_frames = pipeline.stretched.len() / channels;
        loop {
            pipeline.stretched.fill(0.0);
            let frames = pipeline
                .stretcher
                .receive_samples(&mut pipeline.stretched, max_frames);
            if frames == 0 {
                break;
            }
            self.push_to_ring(&pipeline.stretched[..frames * channels]);
        }
    }

    /// Add samples to the ring, emitting blocks whenever it fills up
    fn push_to_ring(&self, samples: &[f32]) {
        let core = &self.core;
        let mut rest = samples;
        while !rest.is_empty() {
            let added = core.ring.add(rest);
            rest = &rest[added..];
            if !rest.is_empty() && core.send_blocks() == 0 {
                if core.should_exit() || core.is_seeking() {
                    return;
                }
                core.wait();
            }
        }
    }

    /// End of stream with an empty queue: flush, pad the tail, finish
    fn drain_tail(&self, pipeline: &mut Pipeline) {
        let core = &self.core;
        if pipeline.stretching {
            pipeline.stretcher.flush();
            self.pull_stretched(pipeline);
        }
        core.send_blocks();
        if core.should_exit() || core.is_seeking() {
            return;
        }
        if core.send_tail() {
            core.finish();
        }
    }
}
