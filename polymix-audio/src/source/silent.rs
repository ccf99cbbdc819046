//! Timed silence, used to anchor a session's duration when no file is loaded

use super::base::{SourceContext, SourceCore, SourceKind, TaskSet};
use crate::error::{EngineError, Result};
use crate::state::PlaybackState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct SilentSource {
    core: Arc<SourceCore>,
    /// Held while a block is dispatched and while a seek moves the position
    gate: Arc<Mutex<()>>,
    tasks: TaskSet,
}

impl SilentSource {
    pub fn new(ctx: SourceContext, duration: Duration, channels: u16, sample_rate: u32) -> Self {
        Self {
            core: Arc::new(SourceCore::new(
                &ctx,
                SourceKind::Silent,
                channels,
                sample_rate,
                duration,
            )),
            gate: Arc::new(Mutex::new(())),
            tasks: TaskSet::default(),
        }
    }

    pub(crate) fn core(&self) -> &SourceCore {
        &self.core
    }

    pub fn change_state(&self, state: PlaybackState) -> Result<()> {
        let core = &self.core;
        core.ensure_live()?;
        match state {
            PlaybackState::Idle => {
                core.set_state(PlaybackState::Idle);
                self.tasks.join_all();
                core.drain_blocks();
                Ok(())
            }
            PlaybackState::Playing | PlaybackState::Paused if core.state.is_idle() => {
                self.tasks.join_all();
                core.set_state(state);
                let worker = self.core.clone();
                let gate = self.gate.clone();
                self.tasks.spawn(format!("polymix-silent-{}", core.id.0), move || {
                    run(worker, gate)
                })
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                core.set_state(state);
                Ok(())
            }
            other => Err(EngineError::InvalidState(other)),
        }
    }

    pub fn seek(&self, position: Duration) -> Result<bool> {
        let core = &self.core;
        core.ensure_live()?;
        core.set_seeking(true);
        {
            let _gate = self.gate.lock();
            core.drain_blocks();
            core.set_finished(false);
            core.set_position(position.min(core.duration()));
        }
        core.set_seeking(false);
        Ok(true)
    }

    pub fn dispose(&self) {
        if !self.core.mark_disposed() {
            return;
        }
        self.core.set_state(PlaybackState::Idle);
        self.tasks.join_all();
        self.core.drain_blocks();
    }
}

impl Drop for SilentSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run(core: Arc<SourceCore>, gate: Arc<Mutex<()>>) {
    let block = core.block_samples();
    while !core.should_exit() {
        if core.state.get() == PlaybackState::Paused || core.is_seeking() || core.is_finished() {
            core.wait();
            continue;
        }
        if core.position() >= core.duration() {
            core.finish();
            continue;
        }
        let _gate = gate.lock();
        if core.is_seeking() {
            continue;
        }
        let buffer = core.pool.rent(block);
        core.dispatch(buffer, block);
    }
    debug!("Silent source {} exiting", core.id);
}
