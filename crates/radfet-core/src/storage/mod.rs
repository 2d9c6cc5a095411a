//! Persistent circular sample log.
//!
//! The storage region is split in two parts:
//! - a ring of fixed-size packet slots, overwritten oldest-first once full
//! - a single metadata record, stored beyond the ring, that tells where the
//!   next packet goes and how many samples were ever recorded
//!
//! Metadata, not the packet payloads, is authoritative on recovery.

pub mod codec;
pub mod region;
pub mod sample_log;

pub use codec::*;
pub use region::{MemoryRegion, MemoryRegionError, Storage};
pub use sample_log::{LogSnapshot, SampleLog};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::ConfigError;

/// Number of dosimeters on the payload (D1..D5)
pub const NUM_RADFETS: usize = 5;

/// Readings taken per dosimeter per cycle (R1 and R2 transistor)
pub const READINGS_PER_RADFET: usize = 2;

/// Default sampling interval, one sample per minute
pub const DEFAULT_SAMPLE_RATE_MS: u32 = 60_000;

/// ADC readings of one sampling cycle, `[dosimeter][R1, R2]`
pub type Readings = [[i16; READINGS_PER_RADFET]; NUM_RADFETS];

/// One dosimeter sample as recorded in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    /// Monotonic sequence number, equal to `samples_saved` at append time
    pub index: u32,
    /// Raw ADC values, `[dosimeter][R1, R2]`
    pub readings: Readings,
}

impl Sample {
    pub const fn new(index: u32, readings: Readings) -> Self {
        Self { index, readings }
    }
}

/// The sample log as shared between the producer and the retrieval task.
///
/// Lock it around one slot or metadata access at a time only.
pub type SharedSampleLog<S> = Mutex<CriticalSectionRawMutex, SampleLog<S>>;

/// Placement of the ring and the metadata record inside the storage region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLayout {
    /// First byte of the ring
    pub ring_start: u32,
    /// Bytes reserved for the ring; the tail that cannot hold a whole packet is unused
    pub ring_size: u32,
    /// Address of the 14-byte metadata record
    pub metadata_address: u32,
}

impl LogLayout {
    pub const fn new(ring_start: u32, ring_size: u32, metadata_address: u32) -> Self {
        Self {
            ring_start,
            ring_size,
            metadata_address,
        }
    }

    /// Ring followed by the metadata record, one page of guard past the
    /// first page boundary at or after the end of the ring.
    pub const fn trailing(ring_start: u32, ring_size: u32, page_size: u32) -> Self {
        let end = ring_start.saturating_add(ring_size);
        let metadata_address = if page_size == 0 {
            end
        } else {
            end.div_ceil(page_size)
                .saturating_mul(page_size)
                .saturating_add(page_size)
        };
        Self::new(ring_start, ring_size, metadata_address)
    }

    /// Number of whole packet slots in the ring
    pub const fn capacity_packets(&self) -> u32 {
        self.ring_size / PACKET_SIZE as u32
    }

    /// Bytes of the ring actually addressed by slots
    pub const fn capacity_bytes(&self) -> u32 {
        self.capacity_packets() * PACKET_SIZE as u32
    }

    /// Check the layout against a storage region of `storage_size` bytes.
    pub fn validate(&self, storage_size: u32) -> Result<(), ConfigError> {
        if self.capacity_packets() == 0 {
            return Err(ConfigError::ZeroCapacity {
                ring_size: self.ring_size,
                packet_size: PACKET_SIZE as u32,
            });
        }

        let ring_end = self.ring_start as u64 + self.ring_size as u64;
        if ring_end > storage_size as u64 {
            return Err(ConfigError::RegionOutOfBounds {
                start: self.ring_start,
                len: self.ring_size,
                storage_size,
            });
        }

        let metadata_end = self.metadata_address as u64 + METADATA_SIZE as u64;
        if metadata_end > storage_size as u64 {
            return Err(ConfigError::RegionOutOfBounds {
                start: self.metadata_address,
                len: METADATA_SIZE as u32,
                storage_size,
            });
        }

        if (self.metadata_address as u64) < ring_end && metadata_end > self.ring_start as u64 {
            return Err(ConfigError::MetadataOverlapsRing {
                address: self.metadata_address,
            });
        }

        Ok(())
    }
}

impl Default for LogLayout {
    /// 256 KiB ring at the start of the region, metadata at 0x0004_0200
    fn default() -> Self {
        Self::trailing(0, 0x0004_0000, 512)
    }
}

/// Errors reported by [`SampleLog`] operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    #[error("storage I/O failed at {address:#010x}")]
    StorageIo { address: u32 },
    #[error("CRC mismatch in slot {slot}")]
    Integrity { slot: u32 },
    #[error("sample {index} written but metadata not persisted")]
    MetadataNotPersisted { index: u32 },
    #[error("logical index {index} outside the {available} available samples")]
    OutOfRange { index: u32, available: u32 },
    #[error("slot {slot} overwritten: expected sample {expected}, found {found}")]
    Overwritten { slot: u32, expected: u32, found: u32 },
    #[error("sample rate must be non-zero")]
    InvalidSampleRate,
}
