use log::{debug, error, info, warn};

use super::{
    LogError, LogLayout, METADATA_SIZE, Metadata, PACKET_SIZE, Sample, Storage, decode_metadata,
    decode_packet, encode_metadata, encode_packet,
};
use crate::config::ConfigError;

const PACKET_BYTES: u32 = PACKET_SIZE as u32;

/// View of the log state taken at one instant.
///
/// Retrieval sessions resolve slots against a snapshot so that appends made
/// while they run never change what they deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    pub write_offset: u32,
    pub samples_saved: u32,
    pub capacity_packets: u32,
}

impl LogSnapshot {
    /// Samples still held by the ring
    pub fn available(&self) -> u32 {
        self.samples_saved.min(self.capacity_packets)
    }

    /// Sequence number the sample at `logical_index` was appended with.
    pub fn sequence_of(&self, logical_index: u32) -> u32 {
        self.samples_saved - self.available() + logical_index
    }

    /// Absolute slot of `logical_index`, 0 being the oldest available sample.
    pub fn slot_of(&self, logical_index: u32) -> Option<u32> {
        let available = self.available();
        if logical_index >= available {
            return None;
        }

        let capacity = self.capacity_packets;
        let next_slot = (self.write_offset / PACKET_BYTES) % capacity;
        let newest_slot = (next_slot + capacity - 1) % capacity;
        let back = available - 1 - logical_index;
        Some((newest_slot + capacity - back) % capacity)
    }
}

/// Circular log of dosimeter samples over a [`Storage`] region.
///
/// Single writer. Every append is followed by a metadata persist; the
/// persisted metadata decides what survives a reset.
pub struct SampleLog<S> {
    storage: S,
    layout: LogLayout,
    metadata: Metadata,
    default_rate_ms: u32,
}

impl<S: Storage> SampleLog<S> {
    /// Create a log over `storage`. State starts empty until
    /// [`load_metadata`](Self::load_metadata) runs.
    pub fn new(storage: S, layout: LogLayout, default_rate_ms: u32) -> Result<Self, ConfigError> {
        layout.validate(storage.size()).map_err(|e| {
            error!("Sample log layout rejected: {}", e);
            e
        })?;
        if default_rate_ms == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }

        info!(
            "Sample log: {} slots of {} bytes @ {:#010x}, metadata @ {:#010x}",
            layout.capacity_packets(),
            PACKET_SIZE,
            layout.ring_start,
            layout.metadata_address
        );

        Ok(Self {
            storage,
            layout,
            metadata: Metadata::empty(default_rate_ms),
            default_rate_ms,
        })
    }

    /// Recover metadata from storage.
    ///
    /// On a read failure, CRC mismatch or out-of-range field the log is reset
    /// to an empty state with the default rate and that state is persisted.
    /// A failed persist is logged only; the log then runs on the in-memory
    /// defaults. Returns whether the stored metadata was usable.
    pub async fn load_metadata(&mut self) -> bool {
        if let Some(metadata) = self.read_stored_metadata().await {
            self.metadata = metadata;
            info!(
                "Metadata loaded: offset={}, count={}, rate={}ms",
                metadata.write_offset, metadata.samples_saved, metadata.sample_rate_ms
            );
            return true;
        }

        info!("Metadata invalid or not found, initializing defaults");
        self.metadata = Metadata::empty(self.default_rate_ms);
        if let Err(e) = self.save_metadata().await {
            error!("Failed to persist default metadata: {}", e);
        }
        false
    }

    /// Bring the log up at boot, see [`load_metadata`](Self::load_metadata).
    pub async fn init(&mut self) -> bool {
        self.load_metadata().await
    }

    async fn read_stored_metadata(&mut self) -> Option<Metadata> {
        let address = self.layout.metadata_address;
        let mut bytes = [0u8; METADATA_SIZE];
        if let Err(e) = self.storage.read(address, &mut bytes).await {
            error!("Failed to read metadata @ {:#010x}: {:?}", address, e);
            return None;
        }

        let (metadata, crc_ok) = decode_metadata(&bytes);
        debug!(
            "Read metadata: offset={}, count={}, rate={}, crc_ok={}",
            metadata.write_offset, metadata.samples_saved, metadata.sample_rate_ms, crc_ok
        );

        let in_range = metadata.write_offset < self.layout.capacity_bytes()
            && metadata.write_offset % PACKET_BYTES == 0
            && metadata.sample_rate_ms != 0;

        if !crc_ok {
            warn!("Metadata CRC mismatch");
            return None;
        }
        if !in_range {
            warn!("Metadata fields out of range: {:?}", metadata);
            return None;
        }
        Some(metadata)
    }

    /// Persist the current metadata.
    pub async fn save_metadata(&mut self) -> Result<(), LogError> {
        let mut metadata = self.metadata;
        metadata.write_offset = self.aligned_write_offset();

        let address = self.layout.metadata_address;
        let bytes = encode_metadata(&metadata);
        self.storage.write(address, &bytes).await.map_err(|e| {
            error!("Failed to write metadata @ {:#010x}: {:?}", address, e);
            LogError::StorageIo { address }
        })
    }

    /// Write offset folded into the ring and rounded down to a slot boundary.
    fn aligned_write_offset(&self) -> u32 {
        let offset = self.metadata.write_offset % self.layout.capacity_bytes();
        offset - offset % PACKET_BYTES
    }

    /// Append one sample at the write position and persist the new metadata.
    ///
    /// `sample.index` must be [`next_index`](Self::next_index); reads check it.
    ///
    /// If the packet write fails nothing changes. If the packet is written
    /// but the metadata persist fails, the in-memory counters still advance
    /// and [`LogError::MetadataNotPersisted`] is returned: the sample is not
    /// durably counted and will be invisible after a reset.
    pub async fn append(&mut self, sample: &Sample) -> Result<(), LogError> {
        let offset = self.aligned_write_offset();
        let address = self.layout.ring_start + offset;
        let packet = encode_packet(sample);

        self.storage.write(address, &packet).await.map_err(|e| {
            error!(
                "Failed to write sample {} @ {:#010x}: {:?}",
                sample.index, address, e
            );
            LogError::StorageIo { address }
        })?;
        debug!("Sample {} written @ offset {}", sample.index, offset);

        self.metadata.write_offset = (offset + PACKET_BYTES) % self.layout.capacity_bytes();
        self.metadata.samples_saved = self.metadata.samples_saved.saturating_add(1);

        self.save_metadata().await.map_err(|_| {
            error!(
                "Sample {} stored but not counted durably, metadata persist failed",
                sample.index
            );
            LogError::MetadataNotPersisted {
                index: sample.index,
            }
        })
    }

    /// Samples currently retrievable
    pub fn available(&self) -> u32 {
        self.snapshot().available()
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            write_offset: self.aligned_write_offset(),
            samples_saved: self.metadata.samples_saved,
            capacity_packets: self.layout.capacity_packets(),
        }
    }

    /// Read logical sample `logical_index`, 0 being the oldest available.
    pub async fn read(&mut self, logical_index: u32) -> Result<Sample, LogError> {
        let snapshot = self.snapshot();
        self.read_at(&snapshot, logical_index).await
    }

    /// Read logical sample `logical_index` as seen by `snapshot`.
    ///
    /// A slot reused by a later append no longer holds the sample the
    /// snapshot saw and reads as [`LogError::Overwritten`].
    pub async fn read_at(
        &mut self,
        snapshot: &LogSnapshot,
        logical_index: u32,
    ) -> Result<Sample, LogError> {
        let slot = snapshot.slot_of(logical_index).ok_or(LogError::OutOfRange {
            index: logical_index,
            available: snapshot.available(),
        })?;
        let address = self.layout.ring_start + slot * PACKET_BYTES;

        let mut bytes = [0u8; PACKET_SIZE];
        self.storage.read(address, &mut bytes).await.map_err(|e| {
            error!("Failed to read slot {} @ {:#010x}: {:?}", slot, address, e);
            LogError::StorageIo { address }
        })?;

        let (sample, crc_ok) = decode_packet(&bytes);
        if !crc_ok {
            warn!(
                "CRC mismatch in slot {} (claims sample {})",
                slot, sample.index
            );
            return Err(LogError::Integrity { slot });
        }

        // Appends made after the snapshot overwrite its oldest slots first
        let expected = snapshot.sequence_of(logical_index);
        if sample.index != expected {
            warn!(
                "Slot {} overwritten: expected sample {}, found {}",
                slot, expected, sample.index
            );
            return Err(LogError::Overwritten {
                slot,
                expected,
                found: sample.index,
            });
        }
        Ok(sample)
    }

    /// Sequence number the next appended sample should carry
    pub fn next_index(&self) -> u32 {
        self.metadata.samples_saved
    }

    pub fn sample_rate_ms(&self) -> u32 {
        self.metadata.sample_rate_ms
    }

    /// Change and persist the producer sampling interval.
    pub async fn set_sample_rate_ms(&mut self, sample_rate_ms: u32) -> Result<(), LogError> {
        if sample_rate_ms == 0 {
            return Err(LogError::InvalidSampleRate);
        }
        self.metadata.sample_rate_ms = sample_rate_ms;
        info!("Sample rate set to {}ms", sample_rate_ms);
        self.save_metadata().await
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata
    }

    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    pub fn capacity_packets(&self) -> u32 {
        self.layout.capacity_packets()
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRegion, NUM_RADFETS, READINGS_PER_RADFET, Readings};
    use embassy_futures::block_on;

    const METADATA_ADDRESS: u32 = 0x100;

    /// Three-slot ring with metadata at 0x100
    fn small_layout() -> LogLayout {
        LogLayout::new(0, 3 * PACKET_BYTES, METADATA_ADDRESS)
    }

    fn sample(index: u32) -> Sample {
        let mut readings: Readings = [[0; READINGS_PER_RADFET]; NUM_RADFETS];
        for (i, radfet) in readings.iter_mut().enumerate() {
            radfet[0] = (index as i16).wrapping_mul(10) + i as i16;
            radfet[1] = -(index as i16) - i as i16;
        }
        Sample::new(index, readings)
    }

    fn fresh_log() -> SampleLog<MemoryRegion> {
        let mut log = SampleLog::new(MemoryRegion::new(0x200), small_layout(), 60_000).unwrap();
        assert!(!block_on(log.load_metadata()));
        log
    }

    #[test]
    fn test_fresh_region_starts_empty() {
        let log = fresh_log();
        assert_eq!(log.available(), 0);
        assert_eq!(log.next_index(), 0);
        assert_eq!(log.sample_rate_ms(), 60_000);
    }

    #[test]
    fn test_zero_capacity_is_a_config_error() {
        let layout = LogLayout::new(0, PACKET_BYTES - 1, METADATA_ADDRESS);
        assert!(matches!(
            SampleLog::new(MemoryRegion::new(0x200), layout, 60_000),
            Err(ConfigError::ZeroCapacity { .. })
        ));
    }

    #[test]
    fn test_zero_default_rate_is_a_config_error() {
        assert!(matches!(
            SampleLog::new(MemoryRegion::new(0x200), small_layout(), 0),
            Err(ConfigError::ZeroSampleRate)
        ));
    }

    #[test]
    fn test_append_and_read_in_order() {
        let mut log = fresh_log();
        for i in 0..2 {
            block_on(log.append(&sample(i))).unwrap();
        }

        assert_eq!(log.available(), 2);
        assert_eq!(block_on(log.read(0)).unwrap(), sample(0));
        assert_eq!(block_on(log.read(1)).unwrap(), sample(1));
        assert_eq!(
            block_on(log.read(2)),
            Err(LogError::OutOfRange {
                index: 2,
                available: 2
            })
        );
    }

    #[test]
    fn test_wraparound_keeps_newest_samples() {
        let mut log = fresh_log();
        for i in 0..5 {
            block_on(log.append(&sample(i))).unwrap();
        }

        assert_eq!(log.available(), 3);
        assert_eq!(block_on(log.read(0)).unwrap().index, 2);
        assert_eq!(block_on(log.read(1)).unwrap().index, 3);
        assert_eq!(block_on(log.read(2)).unwrap().index, 4);
        assert_eq!(log.metadata().samples_saved, 5);
        assert_eq!(log.metadata().write_offset, 2 * PACKET_BYTES);
    }

    #[test]
    fn test_state_survives_reload() {
        let mut log = fresh_log();
        for i in 0..4 {
            block_on(log.append(&sample(i))).unwrap();
        }
        block_on(log.set_sample_rate_ms(5_000)).unwrap();

        let mut reloaded = SampleLog::new(log.into_storage(), small_layout(), 60_000).unwrap();
        assert!(block_on(reloaded.load_metadata()));
        assert_eq!(reloaded.available(), 3);
        assert_eq!(reloaded.next_index(), 4);
        assert_eq!(reloaded.sample_rate_ms(), 5_000);
        assert_eq!(block_on(reloaded.read(2)).unwrap(), sample(3));
    }

    #[test]
    fn test_any_metadata_bit_flip_resets_log() {
        let mut log = fresh_log();
        for i in 0..4 {
            block_on(log.append(&sample(i))).unwrap();
        }
        let pristine = log.into_storage();

        // Every bit of write_offset, samples_saved and sample_rate_ms
        for byte in 0..12u32 {
            for bit in 0..8u8 {
                let mut region = MemoryRegion::new(0x200);
                block_on(region.write(0, pristine.as_bytes())).unwrap();
                region.flip_bit(METADATA_ADDRESS + byte, bit);

                let mut log = SampleLog::new(region, small_layout(), 60_000).unwrap();
                assert!(
                    !block_on(log.load_metadata()),
                    "flip of byte {byte} bit {bit} went unnoticed"
                );
                assert_eq!(log.metadata(), Metadata::empty(60_000));
                assert_eq!(log.available(), 0);
            }
        }
    }

    #[test]
    fn test_reset_metadata_is_persisted() {
        let mut region = MemoryRegion::new(0x200);
        region.flip_bit(METADATA_ADDRESS, 0);
        let mut log = SampleLog::new(region, small_layout(), 30_000).unwrap();
        assert!(!block_on(log.load_metadata()));

        let mut reloaded = SampleLog::new(log.into_storage(), small_layout(), 60_000).unwrap();
        assert!(block_on(reloaded.load_metadata()));
        assert_eq!(reloaded.metadata(), Metadata::empty(30_000));
    }

    #[test]
    fn test_misaligned_offset_is_rejected_on_load() {
        let mut region = MemoryRegion::new(0x200);
        let foreign = Metadata {
            write_offset: 5,
            samples_saved: 2,
            sample_rate_ms: 1_000,
        };
        block_on(region.write(METADATA_ADDRESS, &encode_metadata(&foreign))).unwrap();

        let mut log = SampleLog::new(region, small_layout(), 60_000).unwrap();
        assert!(!block_on(log.load_metadata()));
        assert_eq!(log.metadata(), Metadata::empty(60_000));
    }

    #[test]
    fn test_offset_past_ring_is_rejected_on_load() {
        let mut region = MemoryRegion::new(0x200);
        let foreign = Metadata {
            write_offset: 3 * PACKET_BYTES,
            samples_saved: 2,
            sample_rate_ms: 1_000,
        };
        block_on(region.write(METADATA_ADDRESS, &encode_metadata(&foreign))).unwrap();

        let mut log = SampleLog::new(region, small_layout(), 60_000).unwrap();
        assert!(!block_on(log.load_metadata()));
    }

    #[test]
    fn test_unreadable_metadata_falls_back_to_defaults() {
        let mut region = MemoryRegion::new(0x200);
        region.fail_reads(METADATA_ADDRESS..METADATA_ADDRESS + 1);
        region.fail_writes(METADATA_ADDRESS..METADATA_ADDRESS + 1);

        let mut log = SampleLog::new(region, small_layout(), 60_000).unwrap();
        assert!(!block_on(log.load_metadata()));
        assert_eq!(log.available(), 0);
    }

    #[test]
    fn test_failed_packet_write_leaves_state_untouched() {
        let mut log = fresh_log();
        block_on(log.append(&sample(0))).unwrap();
        log.storage_mut().fail_writes(PACKET_BYTES..2 * PACKET_BYTES);

        assert_eq!(
            block_on(log.append(&sample(1))),
            Err(LogError::StorageIo {
                address: PACKET_BYTES
            })
        );
        assert_eq!(log.available(), 1);
        assert_eq!(log.next_index(), 1);
    }

    #[test]
    fn test_failed_metadata_persist_is_reported() {
        let mut log = fresh_log();
        block_on(log.append(&sample(0))).unwrap();
        log.storage_mut()
            .fail_writes(METADATA_ADDRESS..METADATA_ADDRESS + METADATA_SIZE as u32);

        assert_eq!(
            block_on(log.append(&sample(1))),
            Err(LogError::MetadataNotPersisted { index: 1 })
        );
        // Counted in memory so the next append does not reuse the slot...
        assert_eq!(log.available(), 2);

        // ...but not durably: a reset only sees the first sample.
        log.storage_mut().clear_faults();
        let mut reloaded = SampleLog::new(log.into_storage(), small_layout(), 60_000).unwrap();
        assert!(block_on(reloaded.load_metadata()));
        assert_eq!(reloaded.available(), 1);
    }

    #[test]
    fn test_corrupted_slot_is_an_integrity_error() {
        let mut log = fresh_log();
        for i in 0..3 {
            block_on(log.append(&sample(i))).unwrap();
        }
        log.storage_mut().flip_bit(PACKET_BYTES + 6, 3);

        assert_eq!(block_on(log.read(1)), Err(LogError::Integrity { slot: 1 }));
        assert_eq!(block_on(log.read(2)).unwrap(), sample(2));
    }

    #[test]
    fn test_unreadable_slot_is_a_storage_error() {
        let mut log = fresh_log();
        for i in 0..2 {
            block_on(log.append(&sample(i))).unwrap();
        }
        log.storage_mut().fail_reads(0..1);

        assert_eq!(
            block_on(log.read(0)),
            Err(LogError::StorageIo { address: 0 })
        );
        assert!(block_on(log.read(1)).is_ok());
    }

    #[test]
    fn test_snapshot_ignores_later_appends() {
        let mut log = fresh_log();
        for i in 0..2 {
            block_on(log.append(&sample(i))).unwrap();
        }
        let snapshot = log.snapshot();
        block_on(log.append(&sample(2))).unwrap();

        assert_eq!(snapshot.available(), 2);
        assert_eq!(block_on(log.read_at(&snapshot, 1)).unwrap().index, 1);
        assert!(block_on(log.read_at(&snapshot, 2)).is_err());
    }

    #[test]
    fn test_snapshot_rejects_overwritten_slot() {
        let mut log = fresh_log();
        for i in 0..3 {
            block_on(log.append(&sample(i))).unwrap();
        }
        let snapshot = log.snapshot();
        // Ring is full, the next append reuses the snapshot's oldest slot
        block_on(log.append(&sample(3))).unwrap();

        assert_eq!(
            block_on(log.read_at(&snapshot, 0)),
            Err(LogError::Overwritten {
                slot: 0,
                expected: 0,
                found: 3
            })
        );
        assert_eq!(block_on(log.read_at(&snapshot, 1)).unwrap(), sample(1));
        assert_eq!(block_on(log.read_at(&snapshot, 2)).unwrap(), sample(2));
    }

    #[test]
    fn test_zero_sample_rate_is_rejected() {
        let mut log = fresh_log();
        assert_eq!(
            block_on(log.set_sample_rate_ms(0)),
            Err(LogError::InvalidSampleRate)
        );
        assert_eq!(log.sample_rate_ms(), 60_000);
    }

    #[test]
    fn test_slot_resolution_wraps() {
        let snapshot = LogSnapshot {
            write_offset: PACKET_BYTES,
            samples_saved: 10,
            capacity_packets: 4,
        };
        // newest in slot 0, oldest in slot 1
        assert_eq!(snapshot.slot_of(0), Some(1));
        assert_eq!(snapshot.slot_of(3), Some(0));
        assert_eq!(snapshot.slot_of(4), None);
        assert_eq!(snapshot.sequence_of(0), 6);
        assert_eq!(snapshot.sequence_of(3), 9);
    }
}
