//! Engine configuration
//!
//! Everything the engine needs before the first source is played: device
//! options, queue sizing, and the tuned constants for drift correction and
//! input mixing.

use crate::buffers::DEFAULT_BUCKET_CAPACITY;
use crate::error::{EngineError, Result};
use std::time::Duration;

/// Sample rate, channel count and buffer size of one device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per device buffer
    pub buffer_size: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            buffer_size: 1024,
        }
    }
}

impl DeviceOptions {
    /// Interleaved samples in one device buffer
    pub fn block_samples(&self) -> usize {
        self.buffer_size * self.channels as usize
    }

    /// Wall-clock length of one device buffer
    pub fn block_duration(&self) -> Duration {
        crate::state::samples_to_duration(self.buffer_size, self.sample_rate, 1)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub output: DeviceOptions,
    /// Live input; required for recording
    pub input: Option<DeviceOptions>,
    /// Frames the process task waits for after start and seek
    pub min_queue_frames: usize,
    /// Frame queue capacity
    pub max_queue_frames: usize,
    /// Block queue capacity per source
    pub output_queue_blocks: usize,
    /// Ring buffer size in blocks
    pub ring_blocks: usize,
    /// Pooled buffers kept per size bucket
    pub pool_bucket_capacity: usize,
    /// Position spread between sources that triggers drift correction
    pub drift_spread: Duration,
    /// Distance from the mixed position that gets a source re-seeked
    pub drift_resync: Duration,
    /// Attenuation applied to live input in the master mix
    pub input_gain: f32,
    /// Orchestrator position changes below this are not announced
    pub position_notify_threshold: Duration,
    /// Delay between decoder recreation attempts
    pub recovery_retry_interval: Duration,
    /// Sleep used by every cooperative wait
    pub yield_interval: Duration,
    /// Minimum time between level events
    pub meter_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: DeviceOptions::default(),
            input: None,
            min_queue_frames: 2,
            max_queue_frames: 12,
            output_queue_blocks: 4,
            ring_blocks: 8,
            pool_bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            drift_spread: Duration::from_millis(200),
            drift_resync: Duration::from_millis(100),
            input_gain: 0.8,
            position_notify_threshold: Duration::from_millis(20),
            recovery_retry_interval: Duration::from_secs(1),
            yield_interval: Duration::from_millis(1),
            meter_interval: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        check_device("output", &self.output)?;
        if let Some(input) = &self.input {
            check_device("input", input)?;
        }
        if self.min_queue_frames == 0 || self.max_queue_frames == 0 {
            return invalid("frame queue sizes must be non-zero".into());
        }
        if self.min_queue_frames > self.max_queue_frames {
            return invalid(format!(
                "min_queue_frames ({}) exceeds max_queue_frames ({})",
                self.min_queue_frames, self.max_queue_frames
            ));
        }
        if self.output_queue_blocks == 0 || self.ring_blocks < 2 {
            return invalid("output_queue_blocks must be >= 1 and ring_blocks >= 2".into());
        }
        if self.pool_bucket_capacity == 0 {
            return invalid("pool_bucket_capacity must be non-zero".into());
        }
        if self.drift_resync > self.drift_spread {
            return invalid("drift_resync must not exceed drift_spread".into());
        }
        if !(0.0..=2.0).contains(&self.input_gain) {
            return invalid(format!("input_gain {} outside 0..=2", self.input_gain));
        }
        Ok(())
    }

    /// Per-source sizing derived from this config
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            block_frames: self.output.buffer_size,
            min_queue_frames: self.min_queue_frames,
            max_queue_frames: self.max_queue_frames,
            output_queue_blocks: self.output_queue_blocks,
            ring_blocks: self.ring_blocks,
            recovery_retry_interval: self.recovery_retry_interval,
            yield_interval: self.yield_interval,
        }
    }
}

fn check_device(name: &str, options: &DeviceOptions) -> Result<()> {
    if options.sample_rate == 0 || options.buffer_size == 0 {
        return Err(EngineError::InvalidConfig(format!(
            "{} sample rate and buffer size must be non-zero",
            name
        )));
    }
    if !matches!(options.channels, 1 | 2) {
        return Err(EngineError::InvalidConfig(format!(
            "{} must be mono or stereo, got {} channels",
            name, options.channels
        )));
    }
    Ok(())
}

/// Sizing and timing shared by every source of one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    pub block_frames: usize,
    pub min_queue_frames: usize,
    pub max_queue_frames: usize,
    pub output_queue_blocks: usize,
    pub ring_blocks: usize,
    pub recovery_retry_interval: Duration,
    pub yield_interval: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        EngineConfig::default().source_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.output.block_samples(), 2048);
        assert_eq!(config.input_gain, 0.8);
    }

    #[test]
    fn test_rejects_surround_output() {
        let mut config = EngineConfig::default();
        config.output.channels = 6;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inverted_queue_bounds() {
        let config = EngineConfig {
            min_queue_frames: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_block_duration() {
        let options = DeviceOptions {
            sample_rate: 48000,
            channels: 2,
            buffer_size: 480,
        };
        assert_eq!(options.block_duration(), Duration::from_millis(10));
    }
}
