//! Simple configuration persistence for polymix
//!
//! Stores the engine settings as commented `key=value` lines.

use polymix_audio::{DeviceOptions, EngineConfig};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while reading or writing the config file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Line {line}: invalid value for {key}: {value}")]
    Parse {
        line: usize,
        key: String,
        value: String,
    },
}

/// One `key=value` line being parsed
struct Entry<'a> {
    line: usize,
    key: &'a str,
    value: &'a str,
}

impl Entry<'_> {
    /// Parse straight into the field type, so out-of-range numbers are errors
    fn parse<T: FromStr>(&self) -> Result<T, ConfigError> {
        self.value.parse().map_err(|_| ConfigError::Parse {
            line: self.line,
            key: self.key.to_string(),
            value: self.value.to_string(),
        })
    }

    fn millis(&self) -> Result<Duration, ConfigError> {
        self.parse().map(Duration::from_millis)
    }
}

/// Engine configuration on disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub engine: EngineConfig,
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())?;
        Ok(())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polymix")
            .join("engine.conf")
    }

    /// Parse config from simple key=value format.
    ///
    /// Unknown keys are ignored and missing keys keep their defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut engine = EngineConfig::default();
        let mut input = DeviceOptions::default();
        let mut has_input = false;

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let entry = Entry {
                line: index + 1,
                key: key.trim(),
                value: value.trim(),
            };

            match entry.key {
                "output_sample_rate" => engine.output.sample_rate = entry.parse()?,
                "output_channels" => engine.output.channels = entry.parse()?,
                "output_buffer_size" => engine.output.buffer_size = entry.parse()?,
                "input_enabled" => has_input = entry.parse()?,
                "input_sample_rate" => input.sample_rate = entry.parse()?,
                "input_channels" => input.channels = entry.parse()?,
                "input_buffer_size" => input.buffer_size = entry.parse()?,
                "min_queue_frames" => engine.min_queue_frames = entry.parse()?,
                "max_queue_frames" => engine.max_queue_frames = entry.parse()?,
                "output_queue_blocks" => engine.output_queue_blocks = entry.parse()?,
                "ring_blocks" => engine.ring_blocks = entry.parse()?,
                "pool_bucket_capacity" => engine.pool_bucket_capacity = entry.parse()?,
                "drift_spread_ms" => engine.drift_spread = entry.millis()?,
                "drift_resync_ms" => engine.drift_resync = entry.millis()?,
                "input_gain" => engine.input_gain = entry.parse()?,
                "position_notify_ms" => engine.position_notify_threshold = entry.millis()?,
                "recovery_retry_ms" => engine.recovery_retry_interval = entry.millis()?,
                "yield_us" => engine.yield_interval = Duration::from_micros(entry.parse()?),
                "meter_interval_ms" => engine.meter_interval = entry.millis()?,
                _ => {} // Ignore unknown keys
            }
        }

        engine.input = has_input.then_some(input);
        Ok(Self { engine })
    }

    /// Serialize config to simple key=value format
    pub fn serialize(&self) -> String {
        let e = &self.engine;
        let input = e.input.unwrap_or_default();
        let mut lines = vec![
            "# polymix engine configuration".to_string(),
            "# Device formats are requested, the device may override them".to_string(),
            format!("output_sample_rate={}", e.output.sample_rate),
            format!("output_channels={}", e.output.channels),
            format!("output_buffer_size={}", e.output.buffer_size),
            format!("input_enabled={}", e.input.is_some()),
            format!("input_sample_rate={}", input.sample_rate),
            format!("input_channels={}", input.channels),
            format!("input_buffer_size={}", input.buffer_size),
            String::new(),
            "# Queues".to_string(),
        ];
        lines.push(format!("min_queue_frames={}", e.min_queue_frames));
        lines.push(format!("max_queue_frames={}", e.max_queue_frames));
        lines.push(format!("output_queue_blocks={}", e.output_queue_blocks));
        lines.push(format!("ring_blocks={}", e.ring_blocks));
        lines.push(format!("pool_bucket_capacity={}", e.pool_bucket_capacity));
        lines.push(String::new());
        lines.push("# Mixing".to_string());
        lines.push(format!("drift_spread_ms={}", e.drift_spread.as_millis()));
        lines.push(format!("drift_resync_ms={}", e.drift_resync.as_millis()));
        lines.push(format!("input_gain={}", e.input_gain));
        lines.push(format!(
            "position_notify_ms={}",
            e.position_notify_threshold.as_millis()
        ));
        lines.push(format!(
            "recovery_retry_ms={}",
            e.recovery_retry_interval.as_millis()
        ));
        lines.push(format!("yield_us={}", e.yield_interval.as_micros()));
        lines.push(format!("meter_interval_ms={}", e.meter_interval.as_millis()));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_with_comments() {
        let content = "# Comment\noutput_buffer_size=512\n# Another comment\ndrift_spread_ms=300";
        let config = Config::parse(content).unwrap();
        assert_eq!(config.engine.output.buffer_size, 512);
        assert_eq!(config.engine.drift_spread, Duration::from_millis(300));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = Config::parse("last_scan_folder=/music\ninput_gain=0.5").unwrap();
        assert_eq!(config.engine.input_gain, 0.5);
    }

    #[test]
    fn test_bad_value_names_the_line() {
        let err = Config::parse("# header\nring_blocks=lots").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = Config::parse("output_channels=65538").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Parse { line: 1, ref key, .. } if key == "output_channels"
        ));

        let err = Config::parse("\noutput_sample_rate=4294967296").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));

        assert!(Config::parse("input_channels=-1").is_err());
        assert_eq!(
            Config::parse("output_channels=1").unwrap().engine.output.channels,
            1
        );
    }

    #[test]
    fn test_input_needs_enabling() {
        let config = Config::parse("input_channels=1").unwrap();
        assert!(config.engine.input.is_none());

        let config = Config::parse("input_enabled=true\ninput_channels=1").unwrap();
        assert_eq!(config.engine.input.map(|i| i.channels), Some(1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.conf");

        let mut config = Config::default();
        config.engine.max_queue_frames = 20;
        config.engine.input_gain = 0.6;
        config.engine.yield_interval = Duration::from_micros(500);
        config.engine.input = Some(DeviceOptions {
            sample_rate: 48000,
            channels: 1,
            buffer_size: 256,
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
