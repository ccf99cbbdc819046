//! Device that plays into memory
//!
//! Used for headless runs and tests. Unpaced, `send` returns immediately and
//! the mixer runs as fast as the sources can feed it; paced, `send` sleeps
//! to the wall-clock length of each block like a sound card would.

use super::OutputDevice;
use crate::config::DeviceOptions;
use crate::error::DeviceError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Pacing falls back to "now" if the sender is this far behind
const MAX_LAG: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Sink {
    blocks: usize,
    samples: u64,
    last_block: Vec<f32>,
    max_abs: f32,
    recorded: Vec<f32>,
    deadline: Option<Instant>,
}

/// In-memory output device
pub struct NullDevice {
    output: DeviceOptions,
    input: Option<DeviceOptions>,
    paced: bool,
    record: bool,
    stopped: AtomicBool,
    sink: Mutex<Sink>,
    input_queue: Mutex<VecDeque<f32>>,
}

impl NullDevice {
    /// Unpaced device
    pub fn new(output: DeviceOptions) -> Self {
        Self {
            output,
            input: None,
            paced: false,
            record: false,
            stopped: AtomicBool::new(true),
            sink: Mutex::new(Sink::default()),
            input_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Device that consumes blocks in real time
    pub fn paced(output: DeviceOptions) -> Self {
        Self {
            paced: true,
            ..Self::new(output)
        }
    }

    /// Enable the input side
    pub fn with_input(mut self, input: DeviceOptions) -> Self {
        self.input = Some(input);
        self
    }

    /// Keep every sample that is sent
    pub fn with_recording(mut self) -> Self {
        self.record = true;
        self
    }

    /// Queue samples for `receive_input`
    pub fn feed_input(&self, samples: &[f32]) {
        self.input_queue.lock().extend(samples.iter().copied());
    }

    pub fn blocks_sent(&self) -> usize {
        self.sink.lock().blocks
    }

    pub fn samples_sent(&self) -> u64 {
        self.sink.lock().samples
    }

    pub fn last_block(&self) -> Vec<f32> {
        self.sink.lock().last_block.clone()
    }

    /// Largest absolute sample seen so far
    pub fn max_abs(&self) -> f32 {
        self.sink.lock().max_abs
    }

    /// Everything sent, if recording was enabled
    pub fn recorded(&self) -> Vec<f32> {
        self.sink.lock().recorded.clone()
    }

    fn block_duration(&self, len: usize) -> Duration {
        let rate = self.output.sample_rate as f64 * self.output.channels.max(1) as f64;
        if rate == 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(len as f64 / rate)
    }
}

impl OutputDevice for NullDevice {
    fn options(&self) -> DeviceOptions {
        self.output
    }

    fn input_options(&self) -> Option<DeviceOptions> {
        self.input
    }

    fn start(&self) -> Result<(), DeviceError> {
        self.stopped.store(false, Ordering::Release);
        self.sink.lock().deadline = None;
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn send(&self, block: &[f32]) -> Result<(), DeviceError> {
        let wait = {
            let mut sink = self.sink.lock();
            sink.blocks += 1;
            sink.samples += block.len() as u64;
            sink.max_abs = sink.max_abs.max(crate::buffers::mix::peak(block));
            sink.last_block.clear();
            sink.last_block.extend_from_slice(block);
            if self.record {
                sink.recorded.extend_from_slice(block);
            }

            if self.paced {
                let now = Instant::now();
                let deadline = match sink.deadline {
                    Some(d) if d + MAX_LAG > now => d,
                    _ => now,
                } + self.block_duration(block.len());
                sink.deadline = Some(deadline);
                deadline.checked_duration_since(now)
            } else {
                None
            }
        };

        if let Some(wait) = wait {
            thread::sleep(wait);
        }
        Ok(())
    }

    fn receive_input(&self, out: &mut [f32]) -> usize {
        let mut queue = self.input_queue.lock();
        let n = out.len().min(queue.len());
        for (dst, src) in out.iter_mut().zip(queue.drain(..n)) {
            *dst = src;
        }
        n
    }
}
