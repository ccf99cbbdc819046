//! Externally fed samples, e.g. a synthesizer running on the caller's thread

use super::base::{SourceContext, SourceCore, SourceKind, TaskSet};
use crate::error::{EngineError, Result};
use crate::state::PlaybackState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub struct SyntheticSource {
    core: Arc<SourceCore>,
    tasks: TaskSet,
}

impl SyntheticSource {
    pub fn new(ctx: SourceContext, channels: u16, sample_rate: u32) -> Self {
        Self {
            core: Arc::new(SourceCore::new(
                &ctx,
                SourceKind::Synthetic,
                channels,
                sample_rate,
                Duration::ZERO,
            )),
            tasks: TaskSet::default(),
        }
    }

    pub(crate) fn core(&self) -> &SourceCore {
        &self.core
    }

    /// Stage interleaved samples; returns how many fitted in the ring
    pub fn feed(&self, samples: &[f32]) -> usize {
        if self.core.is_disposed() {
            return 0;
        }
        let accepted = self.core.ring.add(samples);
        if accepted < samples.len() {
            trace!(
                "Synthetic source {} dropped {} samples",
                self.core.id,
                samples.len() - accepted
            );
        }
        accepted
    }

    /// Room left in the ring, in samples
    pub fn capacity_left(&self) -> usize {
        self.core.ring.free()
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
                self.tasks
                    .spawn(format!("polymix-synth-{}", core.id.0), move || run(worker))
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                core.set_state(state);
                Ok(())
            }
            other => Err(EngineError::InvalidState(other)),
        }
    }

    pub fn dispose(&self) {
        if !self.core.mark_disposed() {
            return;
        }
        self.core.set_state(PlaybackState::Idle);
        self.tasks.join_all();
        self.core.drain_blocks();
        self.core.ring.clear();
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run(core: Arc<SourceCore>) {
    while !core.should_exit() {
        if core.state.get() == PlaybackState::Paused || core.send_blocks() == 0 {
            core.wait();
        }
    }
    debug!("Synthetic source {} exiting", core.id);
}
