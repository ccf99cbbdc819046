//! Live capture passthrough from the device's input side

use super::base::{SourceContext, SourceCore, SourceKind, TaskSet};
use crate::config::DeviceOptions;
use crate::device::OutputDevice;
use crate::error::{EngineError, Result};
use crate::state::PlaybackState;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct InputSource {
    core: Arc<SourceCore>,
    device: Arc<dyn OutputDevice>,
    tasks: TaskSet,
}

impl InputSource {
    /// `options` is the device's input format
    pub fn new(ctx: SourceContext, device: Arc<dyn OutputDevice>, options: DeviceOptions) -> Self {
        Self {
            core: Arc::new(SourceCore::new(
                &ctx,
                SourceKind::Input,
                options.channels,
                options.sample_rate,
                Duration::ZERO,
            )),
            device,
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
                core.ring.clear();
                Ok(())
            }
            PlaybackState::Playing | PlaybackState::Paused if core.state.is_idle() => {
                self.tasks.join_all();
                core.set_state(state);
                let worker = self.core.clone();
                let device = self.device.clone();
                self.tasks
                    .spawn(format!("polymix-input-{}", core.id.0), move || run(worker, device))
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

impl Drop for InputSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run(core: Arc<SourceCore>, device: Arc<dyn OutputDevice>) {
    let mut scratch = vec![0.0f32; core.block_samples()];
    while !core.should_exit() {
        if core.state.get() == PlaybackState::Paused {
            core.wait();
            continue;
        }
        let free = core.ring.free().min(scratch.len());
        let read = device.receive_input(&mut scratch[..free]);
        if read > 0 {
            core.ring.add(&scratch[..read]);
        }
        if core.send_blocks() == 0 && read == 0 {
            core.wait();
        }
    }
    debug!("Input source {} exiting", core.id);
}
