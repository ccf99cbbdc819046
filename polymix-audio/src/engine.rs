//! Orchestrator - owns the sources and runs the mixer thread
//!
//! One explicitly constructed [`Orchestrator`] drives one output device.
//! Each tick the mixer thread pulls at most one block from every source,
//! sums them into the master buffer with per-sample clamping, mixes live
//! input while recording, runs the master chain and hands the result to the
//! device. Metering and capture-to-disk run on a separate aux worker so the
//! mixer never waits on I/O.

use crate::buffers::{mix, BufferPool};
use crate::capture::{CaptureSummary, CaptureWriter};
use crate::config::EngineConfig;
use crate::decoder::DecoderFactory;
use crate::device::OutputDevice;
use crate::effect::Effect;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, SourceId};
use crate::frame::AudioBlock;
use crate::meter::{LevelMeter, LevelSnapshot};
use crate::mixer::{drift_targets, MasterBus};
use crate::source::{
    FileSource, InputSource, SilentSource, Source, SourceContext, SourceKind, SyntheticSource,
};
use crate::state::{distance, DurationCell, PlaybackState, StateCell};
use crate::stretch::{self, StretchFactory};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Blocks the aux worker may fall behind by before metering skips
const AUX_QUEUE_BLOCKS: usize = 256;

/// Work handed to the aux thread
enum AuxJob {
    /// Processed master block: meter it and append it to the capture file
    Block(AudioBlock),
    OpenCapture(CaptureWriter),
    CloseCapture(Sender<io::Result<Option<CaptureSummary>>>),
    ResetMeters,
    Shutdown,
}

/// Meter readings and capture status, guarded by the orchestrator lock
#[derive(Default)]
struct Monitor {
    output: LevelSnapshot,
    input: Option<LevelSnapshot>,
    capturing: bool,
}

struct EngineShared {
    config: EngineConfig,
    device: Arc<dyn OutputDevice>,
    pool: Arc<BufferPool>,
    events: EventBus,
    stretch: StretchFactory,
    sources: RwLock<Vec<Arc<Source>>>,
    /// Live input mixed in while recording
    input: Mutex<Option<Arc<Source>>>,
    state: StateCell,
    position: DurationCell,
    last_notified: DurationCell,
    seeking: AtomicBool,
    recording: AtomicBool,
    next_id: AtomicU64,
    master: Mutex<MasterBus>,
    monitor: Mutex<Monitor>,
    aux: Sender<AuxJob>,
    disposed: AtomicBool,
}

impl EngineShared {
    /// Store the engine state, notifying only on change
    fn set_state(&self, state: PlaybackState) -> bool {
        match self.state.transition(state) {
            Some(previous) => {
                info!("Engine {:?} -> {:?}", previous, state);
                self.events.emit(EngineEvent::StateChanged {
                    source: None,
                    state,
                });
                true
            }
            None => false,
        }
    }

    fn set_position(&self, position: Duration) {
        self.last_notified.set(position);
        if self.position.set(position) {
            self.events.emit(EngineEvent::PositionChanged {
                source: None,
                position,
            });
        }
    }

    fn report(&self, source: Option<SourceId>, message: String) {
        self.events.emit(EngineEvent::Error { source, message });
    }

    fn input_source(&self) -> Option<Arc<Source>> {
        self.input.lock().clone()
    }

    /// Live input added to the collection with `add_input`
    fn input_track(&self) -> Option<Arc<Source>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.kind() == SourceKind::Input)
            .cloned()
    }

    fn duration(&self) -> Duration {
        self.sources
            .read()
            .iter()
            .map(|s| s.duration())
            .max()
            .unwrap_or_default()
    }
}

/// Multi-track playback engine
pub struct Orchestrator {
    shared: Arc<EngineShared>,
    /// Serialises transport and membership changes
    transport: Mutex<()>,
    mixer: Mutex<Option<JoinHandle<()>>>,
    aux: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an engine on `device` with the built-in time-stretcher.
    ///
    /// The device's own output and input formats replace the ones in
    /// `config`.
    pub fn new(config: EngineConfig, device: Arc<dyn OutputDevice>) -> Result<Self> {
        Self::with_stretch_factory(config, device, stretch::default_factory())
    }

    pub fn with_stretch_factory(
        mut config: EngineConfig,
        device: Arc<dyn OutputDevice>,
        stretch: StretchFactory,
    ) -> Result<Self> {
        config.output = device.options();
        config.input = device.input_options();
        config.validate()?;

        let pool = Arc::new(BufferPool::new(config.pool_bucket_capacity));
        let (aux_tx, aux_rx) = bounded(AUX_QUEUE_BLOCKS);
        let shared = Arc::new(EngineShared {
            config,
            device,
            pool,
            events: EventBus::new(),
            stretch,
            sources: RwLock::new(Vec::new()),
            input: Mutex::new(None),
            state: StateCell::default(),
            position: DurationCell::default(),
            last_notified: DurationCell::default(),
            seeking: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            master: Mutex::new(MasterBus::new()),
            monitor: Mutex::new(Monitor::default()),
            aux: aux_tx,
            disposed: AtomicBool::new(false),
        });

        let aux_shared = shared.clone();
        let aux = thread::Builder::new()
            .name("polymix-aux".into())
            .spawn(move || run_aux(aux_shared, aux_rx))?;

        let output = shared.config.output;
        info!(
            "Engine ready: {} Hz, {} ch, {} frames per block{}",
            output.sample_rate,
            output.channels,
            output.buffer_size,
            if shared.config.input.is_some() { ", input enabled" } else { "" }
        );

        Ok(Self {
            shared,
            transport: Mutex::new(()),
            mixer: Mutex::new(None),
            aux: Mutex::new(Some(aux)),
        })
    }

    /// Effective configuration, including the device formats
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Register a new event subscriber
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state.get()
    }

    /// Position of the mixed output
    pub fn position(&self) -> Duration {
        self.shared.position.get()
    }

    /// Longest source duration
    pub fn duration(&self) -> Duration {
        self.shared.duration()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.shared.sources.read().clone()
    }

    pub fn source(&self, id: SourceId) -> Option<Arc<Source>> {
        self.shared
            .sources
            .read()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    fn require_idle(&self, operation: &'static str) -> Result<()> {
        if self.shared.state.is_idle() {
            Ok(())
        } else {
            Err(EngineError::NotIdle(operation))
        }
    }

    fn context(&self) -> SourceContext {
        let shared = &self.shared;
        SourceContext::new(
            SourceId(shared.next_id.fetch_add(1, Ordering::Relaxed)),
            shared.pool.clone(),
            shared.events.clone(),
            shared.config.source_settings(),
        )
    }

    fn insert(&self, source: Arc<Source>) -> Result<SourceId> {
        let output = self.shared.config.output;
        if let Err(e) = mix::check_layout(source.channels(), output.channels) {
            source.dispose();
            return Err(e);
        }
        if source.sample_rate() != output.sample_rate {
            warn!(
                "Source {} runs at {} Hz but the output runs at {} Hz",
                source.id(),
                source.sample_rate(),
                output.sample_rate
            );
        }

        // Live sources join a session that is already running
        match self.shared.state.get() {
            PlaybackState::Idle => {}
            PlaybackState::Paused => source.change_state(PlaybackState::Paused)?,
            _ => source.change_state(PlaybackState::Playing)?,
        }

        let id = source.id();
        info!("Added {} source {}", source.kind(), id);
        self.shared.sources.write().push(source);
        self.shared.events.emit(EngineEvent::SourceAdded(id));
        Ok(id)
    }

    /// Load a file-backed track. Only allowed while idle.
    pub fn load_file(&self, factory: Arc<dyn DecoderFactory>) -> Result<SourceId> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        self.require_idle("loading a file")?;
        let source = FileSource::open(self.context(), factory, &self.shared.stretch)?;
        self.insert(Arc::new(source.into()))
    }

    /// Add timed silence at the output sample rate. Only allowed while idle.
    pub fn add_silent(&self, duration: Duration, channels: u16) -> Result<SourceId> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        self.require_idle("adding a silent source")?;
        let rate = self.shared.config.output.sample_rate;
        self.insert(Arc::new(
            SilentSource::new(self.context(), duration, channels, rate).into(),
        ))
    }

    /// Add the live-input track; allowed at any time.
    ///
    /// The device input has a single reader, so there is at most one input
    /// track: a second call returns the existing id, and an input already
    /// opened by [`record`](Self::record) becomes the track.
    pub fn add_input(&self) -> Result<SourceId> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        let options = self
            .shared
            .config
            .input
            .ok_or_else(|| EngineError::InvalidConfig("no input device configured".into()))?;
        if let Some(track) = self.shared.input_track() {
            debug!("Input track {} already present", track.id());
            return Ok(track.id());
        }
        let taken = self.shared.input.lock().take();
        let source = match taken {
            Some(source) => source,
            None => Arc::new(Source::from(InputSource::new(
                self.context(),
                self.shared.device.clone(),
                options,
            ))),
        };
        self.insert(source)
    }

    /// Add an externally fed track at the output sample rate; allowed at any time.
    ///
    /// Feed it through `source(id)` and [`Source::as_synthetic`].
    pub fn add_synthetic(&self, channels: u16) -> Result<SourceId> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        let rate = self.shared.config.output.sample_rate;
        self.insert(Arc::new(
            SyntheticSource::new(self.context(), channels, rate).into(),
        ))
    }

    /// Remove and dispose a source. Only allowed while idle.
    pub fn remove(&self, id: SourceId) -> Result<()> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        self.require_idle("removing a source")?;
        let source = {
            let mut sources = self.shared.sources.write();
            let index = sources
                .iter()
                .position(|s| s.id() == id)
                .ok_or(EngineError::SourceNotFound(id.0))?;
            sources.remove(index)
        };
        source.dispose();
        info!("Removed source {}", id);
        self.shared.events.emit(EngineEvent::SourceRemoved(id));
        Ok(())
    }

    /// Request a transport state. `Buffering` cannot be requested.
    pub fn set_state(&self, state: PlaybackState) -> Result<()> {
        match state {
            PlaybackState::Idle => self.stop(),
            PlaybackState::Playing => self.play(),
            PlaybackState::Paused => self.pause(),
            PlaybackState::Recording => self.record(),
            PlaybackState::Buffering => Err(EngineError::InvalidState(state)),
        }
    }

    pub fn play(&self) -> Result<()> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        match self.shared.state.get() {
            PlaybackState::Idle => self.start_session(PlaybackState::Playing),
            PlaybackState::Paused => self.resume(),
            _ => Ok(()),
        }
    }

    /// Play with live input mixed into the master bus
    pub fn record(&self) -> Result<()> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        let input = self.recording_input()?;
        self.shared.recording.store(true, Ordering::Release);
        match self.shared.state.get() {
            PlaybackState::Idle => self.start_session(PlaybackState::Recording),
            PlaybackState::Paused => self.resume(),
            PlaybackState::Playing | PlaybackState::Buffering => {
                input.change_state(PlaybackState::Playing)?;
                self.shared.set_state(PlaybackState::Recording);
                Ok(())
            }
            PlaybackState::Recording => Ok(()),
        }
    }

    pub fn pause(&self) -> Result<()> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        if !self.shared.state.get().is_running() {
            return Ok(());
        }
        for source in self.shared.sources.read().iter() {
            source.change_state(PlaybackState::Paused)?;
        }
        if let Some(input) = self.shared.input_source() {
            input.change_state(PlaybackState::Paused)?;
        }
        self.shared.set_state(PlaybackState::Paused);
        Ok(())
    }

    /// End the session: every source goes idle and rewinds to zero
    pub fn stop(&self) -> Result<()> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        self.halt();
        Ok(())
    }

    fn halt(&self) {
        self.shared.set_state(PlaybackState::Idle);
        self.join_mixer();
        reset_session(&self.shared);
    }

    /// The input mixed while recording: the input track if there is one,
    /// otherwise a dedicated source opened on first use
    fn recording_input(&self) -> Result<Arc<Source>> {
        let options = self.shared.config.input.ok_or_else(|| {
            EngineError::InvalidConfig("recording needs an input device".into())
        })?;
        if let Some(track) = self.shared.input_track() {
            return Ok(track);
        }
        let mut input = self.shared.input.lock();
        if let Some(source) = input.as_ref() {
            return Ok(source.clone());
        }
        let source = Arc::new(Source::from(InputSource::new(
            self.context(),
            self.shared.device.clone(),
            options,
        )));
        mix::check_layout(source.channels(), self.shared.config.output.channels)?;
        *input = Some(source.clone());
        Ok(source)
    }

    fn start_session(&self, state: PlaybackState) -> Result<()> {
        let shared = &self.shared;
        self.join_mixer();
        shared.master.lock().reset();
        let _ = shared.aux.try_send(AuxJob::ResetMeters);

        if let Err(e) = self.start_sources(state == PlaybackState::Recording) {
            reset_session(shared);
            return Err(e);
        }

        shared.set_state(state);
        let mixer_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("polymix-mixer".into())
            .spawn(move || run_mixer(mixer_shared));
        match handle {
            Ok(handle) => {
                *self.mixer.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                shared.set_state(PlaybackState::Idle);
                reset_session(shared);
                Err(e.into())
            }
        }
    }

    fn start_sources(&self, recording: bool) -> Result<()> {
        let shared = &self.shared;
        for source in shared.sources.read().iter() {
            source.change_state(PlaybackState::Playing)?;
        }
        if recording {
            if let Some(input) = shared.input_source() {
                input.change_state(PlaybackState::Playing)?;
            }
        }
        shared.device.start()?;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        let recording = shared.recording.load(Ordering::Acquire);
        self.start_sources(recording)?;
        shared.set_state(if recording {
            PlaybackState::Recording
        } else {
            PlaybackState::Playing
        });
        Ok(())
    }

    fn join_mixer(&self) {
        let handle = self.mixer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Mixer thread panicked");
            }
        }
    }

    /// Move every seekable source (and the mix) to `position`.
    ///
    /// Returns false if any source refused; those keep their old position.
    pub fn seek(&self, position: Duration) -> Result<bool> {
        let _transport = self.transport.lock();
        self.ensure_live()?;
        let shared = &self.shared;
        let duration = shared.duration();
        let position = if duration > Duration::ZERO {
            position.min(duration)
        } else {
            position
        };

        shared.seeking.store(true, Ordering::Release);
        let mut all = true;
        for source in shared.sources.read().iter().filter(|s| s.is_seekable()) {
            match source.seek(position) {
                Ok(true) => {}
                Ok(false) => all = false,
                Err(e) => {
                    warn!("Seek skipped source {}: {}", source.id(), e);
                    all = false;
                }
            }
        }
        shared.set_position(position);
        shared.seeking.store(false, Ordering::Release);
        debug!("Engine seek to {:?} (all sources: {})", position, all);
        Ok(all)
    }

    /// Master volume, clamped to 0.0..=2.0
    pub fn set_volume(&self, volume: f32) {
        self.shared.master.lock().set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.shared.master.lock().volume()
    }

    /// Install (or clear) the master effect, run before master volume
    pub fn set_master_effect(&self, effect: Option<Box<dyn Effect>>) {
        self.shared.master.lock().set_effect(effect);
    }

    /// Latest output and input levels
    pub fn levels(&self) -> (LevelSnapshot, Option<LevelSnapshot>) {
        let monitor = self.shared.monitor.lock();
        (monitor.output, monitor.input)
    }

    /// Start appending the master output to a raw sample file
    pub fn start_capture(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_live()?;
        let output = self.shared.config.output;
        let writer = CaptureWriter::create(path.as_ref(), output.sample_rate, output.channels)?;
        self.shared
            .aux
            .send(AuxJob::OpenCapture(writer))
            .map_err(|_| EngineError::Disposed)?;
        self.shared.monitor.lock().capturing = true;
        info!("Capturing output to {}", path.as_ref().display());
        Ok(())
    }

    /// Close the capture file; `None` if no capture was running
    pub fn stop_capture(&self) -> Result<Option<CaptureSummary>> {
        self.ensure_live()?;
        let (reply_tx, reply_rx) = bounded(1);
        self.shared
            .aux
            .send(AuxJob::CloseCapture(reply_tx))
            .map_err(|_| EngineError::Disposed)?;
        let summary = reply_rx.recv().map_err(|_| EngineError::Disposed)??;
        self.shared.monitor.lock().capturing = false;
        if let Some(summary) = &summary {
            info!(
                "Capture closed: {} samples in {}",
                summary.samples,
                summary.path.display()
            );
        }
        Ok(summary)
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.monitor.lock().capturing
    }

    /// Stop everything, dispose every source and shut the aux worker down.
    /// Later calls do nothing.
    pub fn dispose(&self) {
        if self.shared.disposed.load(Ordering::Acquire) {
            return;
        }
        let _transport = self.transport.lock();
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.halt();

        let sources: Vec<_> = self.shared.sources.write().drain(..).collect();
        for source in sources {
            source.dispose();
        }
        if let Some(input) = self.shared.input.lock().take() {
            input.dispose();
        }

        let _ = self.shared.aux.send(AuxJob::Shutdown);
        if let Some(handle) = self.aux.lock().take() {
            if handle.join().is_err() {
                error!("Aux thread panicked");
            }
        }
        info!("Engine disposed");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Idle every source, rewind to zero and stop the device
fn reset_session(shared: &EngineShared) {
    for source in shared.sources.read().iter() {
        if let Err(e) = source.change_state(PlaybackState::Idle) {
            warn!("Could not stop source {}: {}", source.id(), e);
        }
        if source.is_seekable() {
            if let Err(e) = source.seek(Duration::ZERO) {
                warn!("Could not rewind source {}: {}", source.id(), e);
            }
        }
    }
    if let Some(input) = shared.input_source() {
        if let Err(e) = input.change_state(PlaybackState::Idle) {
            warn!("Could not stop input: {}", e);
        }
    }
    shared.recording.store(false, Ordering::Release);
    shared.device.stop();
    shared.set_position(Duration::ZERO);
    let _ = shared.aux.try_send(AuxJob::ResetMeters);
}

/// Called on the mixer thread when the mix reaches its end
fn finish_session(shared: &EngineShared) {
    info!("Session finished at {:?}", shared.position.get());
    reset_session(shared);
    shared.set_state(PlaybackState::Idle);
}

fn run_mixer(shared: Arc<EngineShared>) {
    let config = &shared.config;
    let output = config.output;
    let block_len = output.block_samples();
    let block_duration = output.block_duration();

    let mut master = vec![0.0f32; block_len];
    let input_rate = config.input.map_or(output.sample_rate, |i| i.sample_rate);
    let mut input_meter = LevelMeter::new(input_rate);
    let mut positions: Vec<Duration> = Vec::new();
    let mut tracked: Vec<usize> = Vec::new();
    let mut reported: Vec<SourceId> = Vec::new();
    let mut flowed = false;

    debug!("Mixer started: {} samples per block", block_len);

    loop {
        let state = shared.state.get();
        if state == PlaybackState::Idle || shared.disposed.load(Ordering::Acquire) {
            break;
        }

        if shared.seeking.load(Ordering::Acquire) {
            master.fill(0.0);
            thread::sleep(config.yield_interval);
            continue;
        }

        let recording = shared.recording.load(Ordering::Acquire);
        if state == PlaybackState::Paused {
            thread::sleep(config.yield_interval);
            continue;
        }

        let sources = shared.sources.read();
        let ready = sources.iter().any(|s| s.has_block());
        if !ready && !recording {
            let mut finite = sources.iter().filter(|s| s.is_seekable()).peekable();
            let exhausted = finite.peek().is_some() && finite.all(|s| s.is_finished());
            drop(sources);

            if exhausted {
                finish_session(&shared);
                break;
            }
            if flowed
                && shared
                    .state
                    .transition_from(PlaybackState::Playing, PlaybackState::Buffering)
            {
                debug!("Mixer starved, buffering");
                shared.events.emit(EngineEvent::StateChanged {
                    source: None,
                    state: PlaybackState::Buffering,
                });
            }
            thread::sleep(config.yield_interval);
            continue;
        }

        // Drift correction
        let mixed = shared.position.get();
        positions.clear();
        tracked.clear();
        for (i, source) in sources.iter().enumerate() {
            if source.is_seekable() && !source.is_finished() {
                positions.push(source.position());
                tracked.push(i);
            }
        }
        for i in drift_targets(&positions, mixed, config.drift_spread, config.drift_resync) {
            let source = &sources[tracked[i]];
            debug!(
                "Drift: re-seeking source {} from {:?} to {:?}",
                source.id(),
                positions[i],
                mixed
            );
            if let Err(e) = source.seek(mixed) {
                warn!("Drift correction failed for source {}: {}", source.id(), e);
            }
        }

        // Mix; while recording the input track is the live input
        master.fill(0.0);
        for source in sources.iter() {
            let Some(block) = source.try_next_block() else {
                continue;
            };
            let live = recording && source.kind() == SourceKind::Input;
            let gain = if live { config.input_gain } else { 1.0 };
            if let Err(e) = mix::accumulate(
                &mut master,
                block.as_slice(),
                source.channels(),
                output.channels,
                gain,
            ) {
                if !reported.contains(&source.id()) {
                    reported.push(source.id());
                    error!("Source {} skipped: {}", source.id(), e);
                    shared.report(Some(source.id()), e.to_string());
                }
            }
            if live {
                input_meter.process(block.as_slice(), source.channels());
                shared.monitor.lock().input = Some(input_meter.snapshot());
            }
            shared.pool.recycle(block.into_buffer());
        }
        let duration = sources
            .iter()
            .map(|s| s.duration())
            .max()
            .unwrap_or_default();
        drop(sources);

        // Live input
        if recording {
            if let Some(input) = shared.input_source() {
                if let Some(block) = input.try_next_block() {
                    if let Err(e) = mix::accumulate(
                        &mut master,
                        block.as_slice(),
                        input.channels(),
                        output.channels,
                        config.input_gain,
                    ) {
                        error!("Input skipped: {}", e);
                    }
                    input_meter.process(block.as_slice(), input.channels());
                    shared.monitor.lock().input = Some(input_meter.snapshot());
                    shared.pool.recycle(block.into_buffer());
                }
            }
        }

        // Master chain, then metering and capture off-thread
        shared.master.lock().process(&mut master, output.channels);
        let mut copy = shared.pool.rent(block_len);
        copy[..block_len].copy_from_slice(&master);
        if let Err(e) = shared
            .aux
            .try_send(AuxJob::Block(AudioBlock::new(copy, block_len)))
        {
            if let AuxJob::Block(block) = e.into_inner() {
                shared.pool.recycle(block.into_buffer());
            }
            trace!("Aux worker behind, block not metered");
        }

        if let Err(e) = shared.device.send(&master) {
            error!("Device rejected block: {}", e);
            shared.report(None, e.to_string());
        }

        flowed = true;
        if shared
            .state
            .transition_from(PlaybackState::Buffering, PlaybackState::Playing)
        {
            debug!("Mixer fed again");
            shared.events.emit(EngineEvent::StateChanged {
                source: None,
                state: PlaybackState::Playing,
            });
        }

        let position = shared.position.advance(block_duration);
        if distance(position, shared.last_notified.get()) >= config.position_notify_threshold {
            shared.last_notified.set(position);
            shared.events.emit(EngineEvent::PositionChanged {
                source: None,
                position,
            });
        }

        if duration > Duration::ZERO && position >= duration && !recording {
            finish_session(&shared);
            break;
        }
    }
    debug!("Mixer exiting");
}

fn run_aux(shared: Arc<EngineShared>, jobs: Receiver<AuxJob>) {
    let channels = shared.config.output.channels;
    let interval = shared.config.meter_interval;
    let mut meter = LevelMeter::new(shared.config.output.sample_rate);
    let mut writer: Option<CaptureWriter> = None;
    let mut last_levels: Option<Instant> = None;

    for job in jobs.iter() {
        match job {
            AuxJob::Block(block) => {
                meter.process(block.as_slice(), channels);
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write(block.as_slice()) {
                        error!("Capture write failed, closing capture: {}", e);
                        shared.report(None, format!("capture failed: {}", e));
                        writer = None;
                        shared.monitor.lock().capturing = false;
                    }
                }
                shared.pool.recycle(block.into_buffer());

                let output = meter.snapshot();
                let input = {
                    let mut monitor = shared.monitor.lock();
                    monitor.output = output;
                    monitor.input
                };
                if last_levels.map_or(true, |t| t.elapsed() >= interval) {
                    last_levels = Some(Instant::now());
                    shared.events.emit(EngineEvent::Levels { output, input });
                }
            }
            AuxJob::OpenCapture(w) => {
                if let Some(old) = writer.replace(w) {
                    warn!("Replacing an active capture");
                    if let Err(e) = old.finish() {
                        warn!("Failed to close previous capture: {}", e);
                    }
                }
            }
            AuxJob::CloseCapture(reply) => {
                let result = writer.take().map(CaptureWriter::finish).transpose();
                let _ = reply.send(result);
            }
            AuxJob::ResetMeters => {
                meter.reset();
                let mut monitor = shared.monitor.lock();
                monitor.output = LevelSnapshot::default();
                monitor.input = None;
            }
            AuxJob::Shutdown => break,
        }
    }

    if let Some(w) = writer.take() {
        if let Err(e) = w.finish() {
            warn!("Failed to close capture on shutdown: {}", e);
        }
    }
    debug!("Aux worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceOptions;
    use crate::device::NullDevice;

    fn device() -> Arc<NullDevice> {
        Arc::new(NullDevice::paced(DeviceOptions {
            sample_rate: 1000,
            channels: 2,
            buffer_size: 50,
        }))
    }

    fn engine(device: Arc<NullDevice>) -> Orchestrator {
        let config = EngineConfig {
            yield_interval: Duration::from_micros(200),
            ..Default::default()
        };
        Orchestrator::new(config, device).unwrap()
    }

    #[test]
    fn test_device_format_wins() {
        let engine = engine(device());
        assert_eq!(engine.config().output.sample_rate, 1000);
        assert_eq!(engine.config().output.buffer_size, 50);
        assert!(engine.config().input.is_none());
    }

    #[test]
    fn test_buffering_cannot_be_requested() {
        let engine = engine(device());
        assert!(matches!(
            engine.set_state(PlaybackState::Buffering),
            Err(EngineError::InvalidState(PlaybackState::Buffering))
        ));
    }

    #[test]
    fn test_record_without_input_is_rejected() {
        let engine = engine(device());
        assert!(matches!(engine.record(), Err(EngineError::InvalidConfig(_))));
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_membership_changes_need_idle() {
        let engine = engine(device());
        let silent = engine.add_silent(Duration::from_secs(30), 2).unwrap();
        engine.play().unwrap();

        assert!(matches!(
            engine.add_silent(Duration::from_secs(1), 2),
            Err(EngineError::NotIdle(_))
        ));
        assert!(matches!(engine.remove(silent), Err(EngineError::NotIdle(_))));

        // Synthetic sources may join a running session
        let synth = engine.add_synthetic(1).unwrap();
        assert_eq!(engine.source(synth).unwrap().state(), PlaybackState::Playing);

        engine.stop().unwrap();
        engine.remove(silent).unwrap();
        assert!(engine.source(silent).is_none());
        assert!(matches!(
            engine.remove(silent),
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_device_input_has_one_reader() {
        let device = Arc::new(
            NullDevice::paced(DeviceOptions {
                sample_rate: 1000,
                channels: 2,
                buffer_size: 50,
            })
            .with_input(DeviceOptions {
                sample_rate: 1000,
                channels: 1,
                buffer_size: 50,
            }),
        );
        let engine = engine(device);

        // Recording opens the input first; adding a track adopts it
        engine.record().unwrap();
        let recording = engine.recording_input().unwrap();
        let id = engine.add_input().unwrap();
        assert_eq!(recording.id(), id);
        assert!(engine.shared.input_source().is_none());

        assert_eq!(engine.add_input().unwrap(), id);
        assert_eq!(engine.sources().len(), 1);
        let track = engine.source(id).unwrap();
        assert!(Arc::ptr_eq(&engine.recording_input().unwrap(), &track));
        assert_eq!(track.state(), PlaybackState::Playing);
        engine.stop().unwrap();
    }

    #[test]
    fn test_unsupported_layout_is_rejected_at_add() {
        let engine = engine(device());
        assert!(matches!(
            engine.add_synthetic(6),
            Err(EngineError::UnsupportedChannelLayout { input: 6, output: 2 })
        ));
        assert!(engine.sources().is_empty());
    }

    #[test]
    fn test_volume_is_clamped() {
        let engine = engine(device());
        engine.set_volume(3.0);
        assert_eq!(engine.volume(), 2.0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let engine = engine(device());
        engine.add_silent(Duration::from_secs(5), 1).unwrap();
        engine.play().unwrap();
        engine.dispose();
        engine.dispose();
        assert!(matches!(engine.play(), Err(EngineError::Disposed)));
        assert!(engine.sources().is_empty());
    }
}
