//! Observation-level configuration
//!
//! All values are fixed for the duration of an observation. They are usually
//! loaded once from JSON and validated before any buffer is allocated.

use crate::error::{PipelineError, Result};
use crate::output::stream::StreamDescriptor;
use crate::time::DEFAULT_CLOCK_SPEED;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the sample buffer paces its writer against its reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Lock-step: the writer never laps the reader, the reader never passes the writer
    Synchronous,
    /// Paced by the wall clock; late data is flagged instead of waited for
    TimeWindowed,
}

/// What the reader reports for a window whose data did not fully arrive in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateDataPolicy {
    /// Flag the whole window
    FlagWindow,
    /// Flag only the samples that are missing
    FlagMissing,
}

/// Configuration of one circular sample buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of samples per subband held by the buffer
    pub capacity: usize,
    /// Number of subbands
    pub subbands: usize,
    /// Number of polarizations per sample
    pub polarizations: usize,
    /// Samples kept available behind the reader for late or realigned reads
    pub history: usize,
    /// Reader/writer pacing strategy
    pub mode: SyncMode,
    /// Maximum network delay tolerated in time-windowed mode, in milliseconds
    pub max_network_delay_ms: u64,
    /// Alignment unit in samples for subband transfers
    pub alignment: usize,
    /// Station clock in Hz
    pub clock_speed: u32,
    /// Flagging of windows that timed out
    pub late_data_policy: LateDataPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 65536,
            subbands: 8,
            polarizations: 2,
            history: 256,
            mode: SyncMode::TimeWindowed,
            max_network_delay_ms: 250,
            alignment: 8,
            clock_speed: DEFAULT_CLOCK_SPEED,
            late_data_policy: LateDataPolicy::FlagWindow,
        }
    }
}

impl BufferConfig {
    /// Maximum network delay as a duration
    pub fn max_network_delay(&self) -> Duration {
        Duration::from_millis(self.max_network_delay_ms)
    }

    /// Check the invariants the sample buffer relies on
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.subbands == 0 || self.polarizations == 0 {
            return Err(PipelineError::Config(
                "capacity, subbands and polarizations must be positive".to_string(),
            ));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(PipelineError::Config(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.capacity % self.alignment != 0 {
            return Err(PipelineError::Config(format!(
                "capacity {} is not a multiple of the alignment {}",
                self.capacity, self.alignment
            )));
        }
        if self.history >= self.capacity {
            return Err(PipelineError::Config(format!(
                "history {} must be smaller than the capacity {}",
                self.history, self.capacity
            )));
        }
        if self.clock_speed == 0 {
            return Err(PipelineError::Config("clock speed must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration of the output side of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Number of output threads allowed to write at the same time, process-wide
    pub max_concurrent_writers: usize,
    /// Number of reusable blocks per output stream
    pub pool_size: usize,
    /// Stream descriptors of the downstream endpoints
    pub streams: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writers: 4,
            pool_size: 4,
            streams: Vec::new(),
        }
    }
}

impl OutputConfig {
    /// Check limits and that every stream descriptor parses
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_writers == 0 {
            return Err(PipelineError::Config(
                "at least one concurrent writer must be allowed".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(PipelineError::Config("pool size must be positive".to_string()));
        }
        for descriptor in &self.streams {
            descriptor.parse::<StreamDescriptor>()?;
        }
        Ok(())
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sample buffer settings
    pub buffer: BufferConfig,
    /// Output dispatch settings
    pub output: OutputConfig,
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;
        self.output.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{ "buffer": { "capacity": 1024, "mode": "synchronous" },
                 "output": { "streams": ["null:", "tcp:localhost:4000"] } }"#,
        )
        .unwrap();

        assert_eq!(config.buffer.capacity, 1024);
        assert_eq!(config.buffer.mode, SyncMode::Synchronous);
        assert_eq!(config.buffer.polarizations, 2);
        assert_eq!(config.output.streams.len(), 2);
        assert_eq!(config.output.max_concurrent_writers, 4);
    }

    #[test]
    fn test_rejects_misaligned_capacity() {
        let config = BufferConfig {
            capacity: 1000,
            alignment: 16,
            ..BufferConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_history_beyond_capacity() {
        let config = BufferConfig {
            capacity: 128,
            history: 128,
            ..BufferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_descriptor() {
        let result = PipelineConfig::from_json_str(r#"{ "output": { "streams": ["carrier-pigeon:"] } }"#);
        assert!(matches!(result, Err(PipelineError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "buffer": {{ "capacity": 4096, "alignment": 16 }} }}"#).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.buffer.capacity, 4096);
        assert_eq!(config.buffer.alignment, 16);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ not json"),
            Err(PipelineError::Json(_))
        ));
    }
}
