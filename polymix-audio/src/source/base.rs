//! State and block plumbing shared by every source variant

use crate::buffers::{BufferPool, RingSampleBuffer};
use crate::config::SourceSettings;
use crate::effect::{self, Effect};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, SourceId};
use crate::frame::AudioBlock;
use crate::state::{samples_to_duration, AtomicF32, DurationCell, PlaybackState, StateCell};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Which variant a source is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Input,
    Synthetic,
    Silent,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::File => "file",
            SourceKind::Input => "input",
            SourceKind::Synthetic => "synthetic",
            SourceKind::Silent => "silent",
        };
        f.write_str(name)
    }
}

/// Everything a source needs from the engine that owns it
#[derive(Clone)]
pub struct SourceContext {
    pub id: SourceId,
    pub pool: Arc<BufferPool>,
    pub events: EventBus,
    pub settings: SourceSettings,
}

impl SourceContext {
    pub fn new(id: SourceId, pool: Arc<BufferPool>, events: EventBus, settings: SourceSettings) -> Self {
        Self {
            id,
            pool,
            events,
            settings,
        }
    }

    /// Context with a private pool and event bus
    pub fn standalone(id: u64, settings: SourceSettings) -> Self {
        Self::new(SourceId(id), Arc::new(BufferPool::default()), EventBus::new(), settings)
    }
}

pub(crate) struct SourceCore {
    pub id: SourceId,
    pub kind: SourceKind,
    pub pool: Arc<BufferPool>,
    pub events: EventBus,
    pub settings: SourceSettings,
    pub channels: u16,
    pub sample_rate: u32,
    pub state: StateCell,
    pub ring: RingSampleBuffer,
    position: DurationCell,
    duration: DurationCell,
    volume: AtomicF32,
    effect: Mutex<Option<Box<dyn Effect>>>,
    blocks_tx: Sender<AudioBlock>,
    blocks_rx: Receiver<AudioBlock>,
    seeking: AtomicBool,
    finished: AtomicBool,
    disposed: AtomicBool,
}

impl SourceCore {
    pub fn new(
        ctx: &SourceContext,
        kind: SourceKind,
        channels: u16,
        sample_rate: u32,
        duration: Duration,
    ) -> Self {
        let settings = ctx.settings;
        let block = settings.block_frames * channels.max(1) as usize;
        let (blocks_tx, blocks_rx) = bounded(settings.output_queue_blocks.max(1));
        Self {
            id: ctx.id,
            kind,
            pool: ctx.pool.clone(),
            events: ctx.events.clone(),
            settings,
            channels,
            sample_rate,
            state: StateCell::default(),
            ring: RingSampleBuffer::new(block * settings.ring_blocks.max(2)),
            position: DurationCell::default(),
            duration: DurationCell::new(duration),
            volume: AtomicF32::new(1.0),
            effect: Mutex::new(None),
            blocks_tx,
            blocks_rx,
            seeking: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Interleaved samples per output block
    pub fn block_samples(&self) -> usize {
        self.settings.block_frames * self.channels.max(1) as usize
    }

    pub fn block_duration(&self) -> Duration {
        samples_to_duration(self.block_samples(), self.sample_rate, self.channels)
    }

    pub fn position(&self) -> Duration {
        self.position.get()
    }

    /// Store `position`, notifying only on change
    pub fn set_position(&self, position: Duration) {
        if self.position.set(position) {
            self.events.emit(EngineEvent::PositionChanged {
                source: Some(self.id),
                position,
            });
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration.get()
    }

    /// Store `state`, notifying only on change
    pub fn set_state(&self, state: PlaybackState) -> bool {
        match self.state.transition(state) {
            Some(previous) => {
                debug!("Source {} {:?} -> {:?}", self.id, previous, state);
                self.events.emit(EngineEvent::StateChanged {
                    source: Some(self.id),
                    state,
                });
                true
            }
            None => false,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 2.0));
    }

    pub fn set_effect(&self, effect: Option<Box<dyn Effect>>) {
        *self.effect.lock() = effect;
    }

    pub fn reset_effect(&self) {
        if let Some(effect) = self.effect.lock().as_mut() {
            effect.reset();
        }
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    pub fn set_seeking(&self, seeking: bool) {
        self.seeking.store(seeking, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Flag the source disposed; true only for the first call
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    /// True once the owning loops should exit
    pub fn should_exit(&self) -> bool {
        self.state.is_idle() || self.is_disposed()
    }

    /// Cooperative yield
    pub fn wait(&self) {
        thread::sleep(self.settings.yield_interval);
    }

    pub fn try_next_block(&self) -> Option<AudioBlock> {
        self.blocks_rx.try_recv().ok()
    }

    pub fn has_block(&self) -> bool {
        !self.blocks_rx.is_empty()
    }

    pub fn queued_blocks(&self) -> usize {
        self.blocks_rx.len()
    }

    /// Return every queued block to the pool
    pub fn drain_blocks(&self) {
        while let Ok(block) = self.blocks_rx.try_recv() {
            self.pool.recycle(block.into_buffer());
        }
    }

    /// Emit every full block staged in the ring, yielding while the queue
    /// is full; returns blocks emitted
    pub fn send_blocks(&self) -> usize {
        let block = self.block_samples();
        let mut sent = 0;
        while self.ring.len() >= block {
            let mut buffer = self.pool.rent(block);
            let extracted = self.ring.extract(&mut buffer[..block]);
            if extracted < block {
                // Cleared underneath us
                self.pool.recycle(buffer);
                break;
            }
            if !self.dispatch(buffer, block) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Run the processor chain over `buffer[..len]`, queue it and advance
    /// the position. Returns false if the block was dropped because the
    /// source stopped or started seeking while waiting for queue space.
    pub fn dispatch(&self, mut buffer: Vec<f32>, len: usize) -> bool {
        {
            let mut effect = self.effect.lock();
            effect::run_chain(effect.as_mut(), self.volume(), &mut buffer[..len], self.channels);
        }

        let mut block = AudioBlock::new(buffer, len);
        loop {
            match self.blocks_tx.try_send(block) {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    if self.should_exit() || self.is_seeking() {
                        self.pool.recycle(returned.into_buffer());
                        return false;
                    }
                    block = returned;
                    self.wait();
                }
                Err(TrySendError::Disconnected(returned)) => {
                    warn!("Source {} block queue disconnected", self.id);
                    self.pool.recycle(returned.into_buffer());
                    return false;
                }
            }
        }

        let position = self.position.advance(self.block_duration());
        self.events.emit(EngineEvent::PositionChanged {
            source: Some(self.id),
            position,
        });
        true
    }

    /// Pad whatever is left in the ring into one final full block
    pub fn send_tail(&self) -> bool {
        let remaining = self.ring.len();
        if remaining == 0 {
            return true;
        }
        let block = self.block_samples();
        let mut buffer = self.pool.rent(block);
        self.ring.extract(&mut buffer[..remaining.min(block)]);
        self.dispatch(buffer, block)
    }

    /// Announce the end of this source's stream
    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            debug!("Source {} reached end of stream at {:?}", self.id, self.position());
            self.events.emit(EngineEvent::EndOfStream(self.id));
        }
    }
}

/// Join handles of one source's worker threads
#[derive(Default)]
pub(crate) struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn spawn<F>(&self, name: String, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        self.handles.lock().push(handle);
        Ok(())
    }

    /// Wait for every task to exit
    pub fn join_all(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Source task panicked");
            }
        }
    }
}
