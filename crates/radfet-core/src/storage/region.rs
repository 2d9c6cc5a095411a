//! Storage collaborator for the sample log.

use core::ops::Range;

use alloc::vec;
use alloc::vec::Vec;
use thiserror_no_std::Error;

/// Byte-addressable non-volatile region holding the ring and the metadata.
///
/// Erase and alignment semantics belong to the implementation, as does
/// bounding the time of each access: a call must not block indefinitely.
pub trait Storage {
    type Error: core::fmt::Debug;

    /// Total size of the region in bytes
    fn size(&self) -> u32;

    /// Fill `buf` with the bytes starting at `address`.
    fn read(
        &mut self,
        address: u32,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Store `data` starting at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> impl Future<Output = Result<(), Self::Error>>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryRegionError {
    #[error("access {address:#010x}+{len} past end of region")]
    OutOfBounds { address: u32, len: usize },
    #[error("injected fault at {address:#010x}")]
    Injected { address: u32 },
}

/// RAM-backed region, erased to 0xFF, with fault injection.
///
/// Used by the host tests and for bench runs without flash.
pub struct MemoryRegion {
    bytes: Vec<u8>,
    read_faults: Option<Range<u32>>,
    write_faults: Option<Range<u32>>,
}

impl MemoryRegion {
    pub fn new(size: u32) -> Self {
        Self {
            bytes: vec![0xFF; size as usize],
            read_faults: None,
            write_faults: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Flip one bit of the stored contents.
    pub fn flip_bit(&mut self, address: u32, bit: u8) {
        if let Some(byte) = self.bytes.get_mut(address as usize) {
            *byte ^= 1 << (bit % 8);
        }
    }

    /// Fail every read touching `range` until cleared.
    pub fn fail_reads(&mut self, range: Range<u32>) {
        self.read_faults = Some(range);
    }

    /// Fail every write touching `range` until cleared.
    pub fn fail_writes(&mut self, range: Range<u32>) {
        self.write_faults = Some(range);
    }

    pub fn clear_faults(&mut self) {
        self.read_faults = None;
        self.write_faults = None;
    }

    fn span(&self, address: u32, len: usize) -> Result<Range<usize>, MemoryRegionError> {
        let start = address as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(MemoryRegionError::OutOfBounds { address, len })?;
        Ok(start..end)
    }
}

fn touches(faults: &Option<Range<u32>>, span: &Range<usize>) -> bool {
    faults.as_ref().is_some_and(|fault| {
        (fault.start as usize) < span.end && span.start < fault.end as usize
    })
}

impl Storage for MemoryRegion {
    type Error = MemoryRegionError;

    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    async fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let span = self.span(address, buf.len())?;
        if touches(&self.read_faults, &span) {
            return Err(MemoryRegionError::Injected { address });
        }
        buf.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        let span = self.span(address, data.len())?;
        if touches(&self.write_faults, &span) {
            return Err(MemoryRegionError::Injected { address });
        }
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn test_starts_erased() {
        let region = MemoryRegion::new(32);
        assert_eq!(region.size(), 32);
        assert!(region.as_bytes().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn test_out_of_bounds_access_is_an_error() {
        let mut region = MemoryRegion::new(16);
        let mut buf = [0u8; 4];
        assert_eq!(
            block_on(region.read(14, &mut buf)),
            Err(MemoryRegionError::OutOfBounds { address: 14, len: 4 })
        );
    }

    #[test]
    fn test_faults_only_hit_overlapping_accesses() {
        let mut region = MemoryRegion::new(64);
        region.fail_writes(10..20);

        assert!(block_on(region.write(0, &[1; 10])).is_ok());
        assert!(block_on(region.write(20, &[2; 4])).is_ok());
        assert_eq!(
            block_on(region.write(18, &[3; 4])),
            Err(MemoryRegionError::Injected { address: 18 })
        );

        region.clear_faults();
        assert!(block_on(region.write(18, &[3; 4])).is_ok());
        assert_eq!(&region.as_bytes()[18..22], &[3; 4]);
    }
}
