//! Output device collaborator interface
//!
//! The orchestrator hands one mixed block per tick to an [`OutputDevice`]
//! and, while recording, pulls live input back from it. Devices are
//! configured once, at construction, before any source is played.

mod cpal_device;
mod null;

pub use cpal_device::CpalDevice;
pub use null::NullDevice;

use crate::config::DeviceOptions;
use crate::error::DeviceError;

/// PCM sink (and optional capture source) driven by the mixer thread
pub trait OutputDevice: Send + Sync {
    /// Output format the device was configured with
    fn options(&self) -> DeviceOptions;

    /// Input format, if the device captures
    fn input_options(&self) -> Option<DeviceOptions> {
        None
    }

    fn start(&self) -> Result<(), DeviceError>;

    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Queue one interleaved block for playback.
    ///
    /// May block until the device has room, which is what paces the mixer.
    fn send(&self, block: &[f32]) -> Result<(), DeviceError>;

    /// Move captured input into `out`; returns the number of samples written
    fn receive_input(&self, _out: &mut [f32]) -> usize {
        0
    }
}
