//! Fixed binary layouts for sample packets and the metadata record.
//!
//! Every field is little-endian regardless of host so that stored and
//! transmitted bytes decode the same way in ground tooling.
//!
//! Packet slot (26 bytes):
//! - index: 4 bytes (u32)
//! - readings: 20 bytes (5 dosimeters × [R1, R2] × i16)
//! - crc16: 2 bytes, over all preceding bytes
//!
//! Metadata record (14 bytes):
//! - write_offset: 4 bytes (u32)
//! - samples_saved: 4 bytes (u32)
//! - sample_rate_ms: 4 bytes (u32)
//! - crc16: 2 bytes, over all preceding bytes

use crc::{CRC_16_IBM_3740, Crc};

use super::{NUM_RADFETS, READINGS_PER_RADFET, Readings, Sample};

/// CRC-16/CCITT-FALSE: poly 0x1021, init 0xFFFF, MSB-first, no final XOR
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Size of one packet slot in bytes
pub const PACKET_SIZE: usize = 4 + 2 * READINGS_PER_RADFET * NUM_RADFETS + 2;

/// Size of the persisted metadata record in bytes
pub const METADATA_SIZE: usize = 14;

const PACKET_CRC_OFFSET: usize = PACKET_SIZE - 2;
const METADATA_CRC_OFFSET: usize = METADATA_SIZE - 2;

/// Compute the CRC-16/CCITT-FALSE of `bytes`.
pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Encode a sample into its packet slot, CRC included.
pub fn encode_packet(sample: &Sample) -> [u8; PACKET_SIZE] {
    let mut bytes = [0u8; PACKET_SIZE];
    bytes[0..4].copy_from_slice(&sample.index.to_le_bytes());

    let mut offset = 4;
    for radfet in &sample.readings {
        for &value in radfet {
            bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            offset += 2;
        }
    }

    let crc = crc16_ccitt(&bytes[..PACKET_CRC_OFFSET]);
    bytes[PACKET_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    bytes
}

/// Decode a packet slot, returning the sample and whether its CRC matched.
///
/// The sample is decoded even on a mismatch so callers can log what they saw.
pub fn decode_packet(bytes: &[u8; PACKET_SIZE]) -> (Sample, bool) {
    let index = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    let mut readings: Readings = [[0; READINGS_PER_RADFET]; NUM_RADFETS];
    let mut offset = 4;
    for radfet in readings.iter_mut() {
        for value in radfet.iter_mut() {
            *value = i16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
            offset += 2;
        }
    }

    let stored = u16::from_le_bytes([bytes[PACKET_CRC_OFFSET], bytes[PACKET_CRC_OFFSET + 1]]);
    let crc_ok = stored == crc16_ccitt(&bytes[..PACKET_CRC_OFFSET]);

    (Sample { index, readings }, crc_ok)
}

/// Persisted log state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Byte offset inside the ring where the next packet is written
    pub write_offset: u32,
    /// Samples ever appended; the reader clamps this to the ring capacity
    pub samples_saved: u32,
    /// Producer sampling interval
    pub sample_rate_ms: u32,
}

impl Metadata {
    /// Empty log with the given sampling interval
    pub const fn empty(sample_rate_ms: u32) -> Self {
        Self {
            write_offset: 0,
            samples_saved: 0,
            sample_rate_ms,
        }
    }
}

/// Encode the metadata record, CRC included.
pub fn encode_metadata(metadata: &Metadata) -> [u8; METADATA_SIZE] {
    let mut bytes = [0u8; METADATA_SIZE];
    bytes[0..4].copy_from_slice(&metadata.write_offset.to_le_bytes());
    bytes[4..8].copy_from_slice(&metadata.samples_saved.to_le_bytes());
    bytes[8..12].copy_from_slice(&metadata.sample_rate_ms.to_le_bytes());

    let crc = crc16_ccitt(&bytes[..METADATA_CRC_OFFSET]);
    bytes[METADATA_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    bytes
}

/// Decode the metadata record, returning it and whether its CRC matched.
pub fn decode_metadata(bytes: &[u8; METADATA_SIZE]) -> (Metadata, bool) {
    let field = |at: usize| {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };

    let metadata = Metadata {
        write_offset: field(0),
        samples_saved: field(4),
        sample_rate_ms: field(8),
    };

    let stored = u16::from_le_bytes([bytes[METADATA_CRC_OFFSET], bytes[METADATA_CRC_OFFSET + 1]]);
    let crc_ok = stored == crc16_ccitt(&bytes[..METADATA_CRC_OFFSET]);

    (metadata, crc_ok)
}
