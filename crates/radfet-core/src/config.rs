//! Payload configuration.
//!
//! Stored as a postcard blob next to the firmware image (or in a file for the
//! simulator). Everything is validated once at startup; a bad configuration is
//! fatal for the component that needs it.

use alloc::vec::Vec;
use embassy_time::Duration;
use log::error;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::storage::{DEFAULT_SAMPLE_RATE_MS, LogLayout};

/// Largest staging block the retrieval protocol can buffer
pub const MAX_BLOCK_SIZE: usize = 256;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ring of {ring_size} bytes holds no {packet_size}-byte packet")]
    ZeroCapacity { ring_size: u32, packet_size: u32 },
    #[error("region {start:#010x}+{len} exceeds storage of {storage_size} bytes")]
    RegionOutOfBounds {
        start: u32,
        len: u32,
        storage_size: u32,
    },
    #[error("metadata at {address:#010x} overlaps the ring")]
    MetadataOverlapsRing { address: u32 },
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,
    #[error("block size {0} is out of range")]
    InvalidBlockSize(u16),
    #[error("{0} must be non-zero")]
    ZeroLimit(&'static str),
    #[error("configuration blob is malformed")]
    Encoding,
}

/// Tuning of the ground retrieval protocol
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalConfig {
    /// Bytes per transport write; the last block of a session may be shorter
    pub block_size: u16,
    /// Delay after every block, the link has no flow control
    pub pacing_ms: u32,
    /// Hard limit on one session from command to last block
    pub max_transmission_ms: u32,
    /// Wait for one command byte before housekeeping
    pub command_timeout_ms: u32,
    /// Bound on one transport write
    pub write_timeout_ms: u32,
    /// Samples sent by one START_TRANSFER session
    pub max_samples_per_session: u32,
    /// Samples sent by one SEND_LATEST session
    pub latest_count: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            // 64 bytes take ~11ms at 57600 baud, leave the receiver headroom
            pacing_ms: 50,
            max_transmission_ms: 10 * 60 * 1000,
            command_timeout_ms: 1000,
            write_timeout_ms: 1000,
            // Two hours of samples at the default rate
            max_samples_per_session: 120,
            latest_count: 2,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size as usize > MAX_BLOCK_SIZE {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        if self.max_transmission_ms == 0 {
            return Err(ConfigError::ZeroLimit("max_transmission_ms"));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::ZeroLimit("command_timeout_ms"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroLimit("write_timeout_ms"));
        }
        if self.max_samples_per_session == 0 {
            return Err(ConfigError::ZeroLimit("max_samples_per_session"));
        }
        if self.latest_count == 0 {
            return Err(ConfigError::ZeroLimit("latest_count"));
        }
        Ok(())
    }

    pub fn max_transmission(&self) -> Duration {
        Duration::from_millis(self.max_transmission_ms as u64)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms as u64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms as u64)
    }
}

/// Everything the payload needs to start
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadConfig {
    pub layout: LogLayout,
    /// Sampling interval used when no valid metadata is found
    pub default_sample_rate_ms: u32,
    /// How often a paused producer re-checks the pause flag
    pub pause_poll_ms: u32,
    pub retrieval: RetrievalConfig,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            layout: LogLayout::default(),
            default_sample_rate_ms: DEFAULT_SAMPLE_RATE_MS,
            pause_poll_ms: 1000,
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl PayloadConfig {
    /// Check the whole configuration against a storage region of `storage_size` bytes.
    pub fn validate(&self, storage_size: u32) -> Result<(), ConfigError> {
        self.layout.validate(storage_size)?;
        if self.default_sample_rate_ms == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.pause_poll_ms == 0 {
            return Err(ConfigError::ZeroLimit("pause_poll_ms"));
        }
        self.retrieval.validate()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        postcard::from_bytes(bytes).map_err(|e| {
            error!("Failed to decode configuration: {:?}", e);
            ConfigError::Encoding
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|e| {
            error!("Failed to encode configuration: {:?}", e);
            ConfigError::Encoding
        })
    }
}
