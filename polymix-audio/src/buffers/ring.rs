//! Fixed-capacity circular sample buffer
//!
//! Staging area between irregularly sized decoder output and fixed-size
//! block emission. Capacity is a power of two so cursors wrap with a mask.
//! One lock serializes every operation; contention is limited to the process
//! task and whoever clears the buffer on seek or dispose.

use parking_lot::Mutex;

struct RingState {
    data: Box<[f32]>,
    mask: usize,
    read_pos: usize,
    write_pos: usize,
    count: usize,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Thread-safe FIFO of interleaved samples
pub struct RingSampleBuffer {
    state: Mutex<RingState>,
}

impl RingSampleBuffer {
    /// Create a ring buffer holding at least `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            state: Mutex::new(RingState {
                data: vec![0.0; capacity].into_boxed_slice(),
                mask: capacity - 1,
                read_pos: 0,
                write_pos: 0,
                count: 0,
            }),
        }
    }

    /// Append as many samples as fit; excess samples are dropped.
    ///
    /// Returns the number of samples stored.
    pub fn add(&self, samples: &[f32]) -> usize {
        let mut s = self.state.lock();
        let to_write = samples.len().min(s.capacity() - s.count);
        if to_write == 0 {
            return 0;
        }

        let start = s.write_pos;
        let first = to_write.min(s.capacity() - start);
        s.data[start..start + first].copy_from_slice(&samples[..first]);
        if first < to_write {
            s.data[..to_write - first].copy_from_slice(&samples[first..to_write]);
        }

        s.write_pos = (start + to_write) & s.mask;
        s.count += to_write;
        to_write
    }

    /// Move up to `out.len()` samples into `out` in FIFO order.
    ///
    /// Returns the number of samples copied.
    pub fn extract(&self, out: &mut [f32]) -> usize {
        let mut s = self.state.lock();
        let to_read = out.len().min(s.count);
        if to_read == 0 {
            return 0;
        }

        let start = s.read_pos;
        let first = to_read.min(s.capacity() - start);
        out[..first].copy_from_slice(&s.data[start..start + first]);
        if first < to_read {
            out[first..to_read].copy_from_slice(&s.data[..to_read - first]);
        }

        s.read_pos = (start + to_read) & s.mask;
        s.count -= to_read;
        to_read
    }

    /// Drop all buffered samples and zero the storage
    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.data.fill(0.0);
        s.read_pos = 0;
        s.write_pos = 0;
        s.count = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Samples that can be added before the buffer is full
    pub fn free(&self) -> usize {
        let s = self.state.lock();
        s.capacity() - s.count
    }
}

impl std::fmt::Debug for RingSampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RingSampleBuffer")
            .field("capacity", &s.capacity())
            .field("count", &s.count)
            .finish()
    }
}
